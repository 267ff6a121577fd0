//! Output helpers: tables, `--format` templates and multi-target reporting.

use std::future::Future;

use cdbox_core::error::{BoxError, Result};
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// How a listing command prints its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    Table,
    /// One JSON object per line.
    Json,
    /// A Go-style template such as `{{.ID}}\t{{.Names}}`.
    Template(String),
}

impl Format {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("table") => Self::Table,
            Some("json") | Some("{{json .}}") => Self::Json,
            Some(t) => Self::Template(t.to_string()),
        }
    }
}

/// Print rows in the requested format; `table` builds the default table.
pub fn print_rows<T: Serialize>(rows: &[T], format: &Format, table: impl FnOnce(&[T]) -> Table) -> Result<()> {
    match format {
        Format::Table => println!("{}", table(rows)),
        Format::Json => {
            for row in rows {
                println!("{}", serde_json::to_string(row)?);
            }
        }
        Format::Template(t) => {
            for row in rows {
                println!("{}", render(t, &serde_json::to_value(row)?)?);
            }
        }
    }
    Ok(())
}

/// Print one document as indented JSON, or through a template.
pub fn print_document<T: Serialize>(doc: &T, format: Option<&str>) -> Result<()> {
    let value = serde_json::to_value(doc)?;
    match format {
        None | Some("") | Some("json") => println!("{}", serde_json::to_string_pretty(&value)?),
        Some(t) => println!("{}", render(t, &value)?),
    }
    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = value;
    for field in path.split('.').filter(|f| !f.is_empty()) {
        current = current
            .get(field)
            .ok_or_else(|| BoxError::invalid(format!("template: can't evaluate field {field}")))?;
    }
    Ok(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "<no value>".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(display).collect();
            format!("[{}]", inner.join(" "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map.iter().map(|(k, v)| format!("{k}:{}", display(v))).collect();
            format!("map[{}]", inner.join(" "))
        }
        other => other.to_string(),
    }
}

fn unquote(s: &str) -> Option<&str> {
    s.strip_prefix('"')?.strip_suffix('"')
}

fn eval(action: &str, value: &Value) -> Result<String> {
    let words: Vec<&str> = action.split_whitespace().collect();
    match words.as_slice() {
        [path] if path.starts_with('.') => Ok(display(lookup(value, path)?)),
        ["json", path] if path.starts_with('.') => Ok(serde_json::to_string(lookup(value, path)?)?),
        ["join", path, sep] if path.starts_with('.') => {
            let sep = unquote(sep).unwrap_or(sep);
            match lookup(value, path)? {
                Value::Array(items) => Ok(items.iter().map(display).collect::<Vec<_>>().join(sep)),
                other => Ok(display(other)),
            }
        }
        ["upper", path] if path.starts_with('.') => Ok(display(lookup(value, path)?).to_uppercase()),
        ["lower", path] if path.starts_with('.') => Ok(display(lookup(value, path)?).to_lowercase()),
        _ => Err(BoxError::invalid(format!("template: unsupported action {{{{{action}}}}}"))),
    }
}

/// Render a Go-style template against a JSON value.
///
/// Supports `{{.Field}}`, nested `{{.A.B}}`, `{{json .X}}`,
/// `{{join .X ","}}`, `{{upper .X}}` and `{{lower .X}}`; `\t` and `\n`
/// escapes in the template text are expanded.
pub fn render(template: &str, value: &Value) -> Result<String> {
    let template = template.replace("\\t", "\t").replace("\\n", "\n");
    let mut out = String::new();
    let mut rest = template.as_str();
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| BoxError::invalid("template: unclosed action"))?;
        out.push_str(&eval(after[..end].trim(), value)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Run `op` for every target, printing what it returns on stdout and each
/// failure on stderr. Fails if any target failed.
pub async fn each_target<'a, F, Fut>(targets: &'a [String], mut op: F) -> Result<()>
where
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut failed = 0usize;
    for target in targets {
        match op(target).await {
            Ok(line) => {
                if !line.is_empty() {
                    println!("{line}");
                }
            }
            Err(BoxError::Cancelled) => return Err(BoxError::Cancelled),
            Err(e) => {
                eprintln!("Error: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(BoxError::Reported(failed));
    }
    Ok(())
}

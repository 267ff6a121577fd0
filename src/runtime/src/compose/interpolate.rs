//! Variable interpolation over string scalars of a compose document.

use cdbox_core::error::{BoxError, Result};
use serde_yaml::Value;

/// Substitute variables in every string scalar of `value`. Mapping keys are
/// left alone.
pub fn interpolate(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = substitute(s, lookup)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                interpolate(item, lookup)?;
            }
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate(v, lookup)?;
            }
        }
        Value::Tagged(tagged) => interpolate(&mut tagged.value, lookup)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?error}`, `${VAR?error}`, `${VAR:+alt}`, `${VAR+alt}` and `$$`.
pub fn substitute(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        match after.chars().next() {
            Some('$') => {
                out.push('$');
                rest = &after[1..];
            }
            Some('{') => {
                let end = closing_brace(after).ok_or_else(|| {
                    BoxError::invalid(format!("invalid interpolation format for {input:?}: unclosed ${{"))
                })?;
                out.push_str(&expand(&after[1..end], input, lookup)?);
                rest = &after[end + 1..];
            }
            Some(c) if is_name_start(c) => {
                let len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
                out.push_str(&lookup(&after[..len]).unwrap_or_default());
                rest = &after[len..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Index of the `}` closing the `{` at the start of `s`, allowing nested
/// `${...}` in defaults.
fn closing_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn expand(body: &str, input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let name_len = body.find(|c: char| !is_name_char(c)).unwrap_or(body.len());
    let name = &body[..name_len];
    if name.is_empty() || !name.starts_with(is_name_start) {
        return Err(BoxError::invalid(format!(
            "invalid interpolation format for {input:?}: ${{{body}}}"
        )));
    }
    let op = &body[name_len..];
    let value = lookup(name);
    let set = value.is_some();
    let non_empty = value.as_deref().map_or(false, |v| !v.is_empty());

    let (present, arg) = if let Some(arg) = op.strip_prefix(":-") {
        if non_empty {
            return Ok(value.unwrap_or_default());
        }
        return substitute(arg, lookup);
    } else if let Some(arg) = op.strip_prefix('-') {
        if set {
            return Ok(value.unwrap_or_default());
        }
        return substitute(arg, lookup);
    } else if let Some(arg) = op.strip_prefix(":?") {
        (non_empty, arg)
    } else if let Some(arg) = op.strip_prefix('?') {
        (set, arg)
    } else if let Some(arg) = op.strip_prefix(":+") {
        return if non_empty { substitute(arg, lookup) } else { Ok(String::new()) };
    } else if let Some(arg) = op.strip_prefix('+') {
        return if set { substitute(arg, lookup) } else { Ok(String::new()) };
    } else if op.is_empty() {
        return Ok(value.unwrap_or_default());
    } else {
        return Err(BoxError::invalid(format!(
            "invalid interpolation format for {input:?}: ${{{body}}}"
        )));
    };

    if present {
        return Ok(value.unwrap_or_default());
    }
    let message = substitute(arg, lookup)?;
    Err(BoxError::invalid(format!(
        "required variable {name} is missing a value: {message}"
    )))
}

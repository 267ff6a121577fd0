//! `cdbox images`, `cdbox history` and `cdbox image prune` commands.

use std::collections::HashSet;

use cdbox_core::error::Result;
use cdbox_core::units::format_bytes;
use cdbox_runtime::client::ImageInfo;
use cdbox_runtime::filters::{glob_match, Filters};
use cdbox_runtime::lifecycle::human_duration;
use cdbox_runtime::ContainerManager;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use crate::app::App;
use crate::output::{new_table, print_rows, Format};

const FILTER_KEYS: &[&str] = &["reference", "dangling", "label"];

#[derive(Args, Debug, Default)]
pub struct ImagesArgs {
    /// Only show images matching this reference (glob)
    pub reference: Option<String>,

    /// Only show image IDs
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Filter output based on conditions provided
    #[arg(short = 'f', long = "filter")]
    pub filters: Vec<String>,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,

    /// Show digests
    #[arg(long)]
    pub digests: bool,

    /// Don't truncate output
    #[arg(long = "no-trunc")]
    pub no_trunc: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRow {
    pub repository: String,
    pub tag: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub digest: String,
    pub created_since: String,
    pub created_at: String,
    pub size: String,
}

/// `sha256:0123456789ab…` to `0123456789ab`.
pub(crate) fn short_image_id(id: &str) -> String {
    id.trim_start_matches("sha256:").chars().take(12).collect()
}

/// `docker.io/library/alpine:3.19` to (`alpine`, `3.19`).
pub(crate) fn repo_tag(info: &ImageInfo) -> (String, String) {
    if info.is_dangling() {
        return ("<none>".to_string(), "<none>".to_string());
    }
    let familiar = info.familiar_name();
    let name = familiar.split('@').next().unwrap_or(&familiar);
    let slash = name.rfind('/').map_or(0, |i| i + 1);
    match name[slash..].rfind(':') {
        Some(colon) => (name[..slash + colon].to_string(), name[slash + colon + 1..].to_string()),
        None => (name.to_string(), "<none>".to_string()),
    }
}

pub(crate) fn since(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    created
        .map(|c| format!("{} ago", human_duration(now - c)))
        .unwrap_or_else(|| "N/A".to_string())
}

fn matches(info: &ImageInfo, filters: &Filters, reference: Option<&str>) -> Result<bool> {
    if let Some(dangling) = filters.bool("dangling")? {
        if info.is_dangling() != dangling {
            return Ok(false);
        }
    }
    let familiar = info.familiar_name();
    let name_ok = |pattern: &str| {
        glob_match(pattern, &familiar)
            || glob_match(pattern, familiar.split(':').next().unwrap_or(&familiar))
            || glob_match(pattern, &info.name)
    };
    if !filters.any("reference", name_ok) {
        return Ok(false);
    }
    if reference.is_some_and(|r| !name_ok(r)) {
        return Ok(false);
    }
    Ok(filters.labels_match(&info.config.labels))
}

fn table(rows: &[ImageRow], digests: bool) -> comfy_table::Table {
    let mut headers = vec!["REPOSITORY", "TAG"];
    if digests {
        headers.push("DIGEST");
    }
    headers.extend(["IMAGE ID", "CREATED", "SIZE"]);
    let mut table = new_table(&headers);
    for r in rows {
        let mut cells = vec![r.repository.clone(), r.tag.clone()];
        if digests {
            cells.push(r.digest.clone());
        }
        cells.extend([r.id.clone(), r.created_since.clone(), r.size.clone()]);
        table.add_row(cells);
    }
    table
}

pub async fn list(app: &App, args: ImagesArgs) -> Result<()> {
    let filters = Filters::parse(&args.filters, FILTER_KEYS)?;
    let format = Format::parse(args.format.as_deref());
    let services = app.services()?;
    let mut images = Vec::new();
    for info in services.images.list().await? {
        if matches(&info, &filters, args.reference.as_deref())? {
            images.push(info);
        }
    }
    images.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));

    if args.quiet {
        let mut seen = HashSet::new();
        for info in &images {
            let id = if args.no_trunc { info.id.clone() } else { short_image_id(&info.id) };
            if seen.insert(id.clone()) {
                println!("{id}");
            }
        }
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<ImageRow> = images
        .iter()
        .map(|info| {
            let (repository, tag) = repo_tag(info);
            ImageRow {
                repository,
                tag,
                id: if args.no_trunc { info.id.clone() } else { short_image_id(&info.id) },
                digest: info.digest.clone(),
                created_since: since(info.created, now),
                created_at: info.created.map(|c| c.to_rfc3339()).unwrap_or_default(),
                size: format_bytes(info.size),
            }
        })
        .collect();
    print_rows(&rows, &format, |rows| table(rows, args.digests))
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Image reference or ID
    pub image: String,

    /// Only show layer-producing step IDs
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Don't truncate output
    #[arg(long = "no-trunc")]
    pub no_trunc: bool,

    /// Format output using a template, or `json`
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub created_since: String,
    pub created_by: String,
    pub size: String,
    pub comment: String,
}

pub async fn history(app: &App, args: HistoryArgs) -> Result<()> {
    let services = app.services()?;
    let info = services.images.get(&args.image).await?;
    let now = Utc::now();
    let format = Format::parse(args.format.as_deref());

    // Newest step first; only the top row carries the image ID.
    let rows: Vec<HistoryRow> = info
        .history
        .iter()
        .rev()
        .enumerate()
        .map(|(i, h)| {
            let mut created_by = h.created_by.clone();
            if !args.no_trunc && created_by.chars().count() > 45 {
                created_by = created_by.chars().take(44).collect::<String>() + "…";
            }
            HistoryRow {
                id: if i == 0 { short_image_id(&info.id) } else { "<missing>".to_string() },
                created_since: since(h.created, now),
                created_by,
                size: format_bytes(h.size),
                comment: h.comment.clone(),
            }
        })
        .collect();
    if args.quiet {
        for r in &rows {
            println!("{}", r.id);
        }
        return Ok(());
    }
    print_rows(&rows, &format, |rows| {
        let mut t = new_table(&["IMAGE", "CREATED", "CREATED BY", "SIZE", "COMMENT"]);
        for r in rows {
            t.add_row(vec![
                r.id.clone(),
                r.created_since.clone(),
                r.created_by.clone(),
                r.size.clone(),
                r.comment.clone(),
            ]);
        }
        t
    })
}

#[derive(Args, Debug)]
pub struct ImagePruneArgs {
    /// Remove all unused images, not just dangling ones
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Do not prompt for confirmation
    #[arg(short = 'f', long)]
    pub force: bool,
}

/// Config digests of the images containers were created from.
pub(crate) async fn images_in_use(mgr: &ContainerManager) -> Result<HashSet<String>> {
    let mut used = HashSet::new();
    for c in mgr.containers().await? {
        if c.record.image.is_empty() {
            continue;
        }
        match mgr.services().images.get(&c.record.image).await {
            Ok(info) => {
                used.insert(info.id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(used)
}

/// Remove images no container refers to: dangling ones, or every unused one
/// with `all`. Returns the removed names.
pub(crate) async fn prune_images(mgr: &ContainerManager, all: bool) -> Result<Vec<String>> {
    let used = images_in_use(mgr).await?;
    let images = &mgr.services().images;
    let mut removed = Vec::new();
    for info in images.list().await? {
        if used.contains(&info.id) || (!all && !info.is_dangling()) {
            continue;
        }
        match images.remove(&info.name).await {
            Ok(()) => removed.push(info.name),
            Err(e) => tracing::warn!(image = %info.name, error = %e, "failed to prune image"),
        }
    }
    Ok(removed)
}

pub async fn prune(app: &App, args: ImagePruneArgs) -> Result<()> {
    let _ = args.force;
    let mgr = app.manager()?;
    for name in prune_images(&mgr, args.all).await? {
        println!("Untagged: {name}");
    }
    Ok(())
}

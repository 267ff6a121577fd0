//! `cdbox logs` command: fetch the logs of a container.

use std::io::Write;

use cdbox_core::error::Result;
use cdbox_core::log::{LogEntry, LogStream};
use cdbox_runtime::logging::consumer::{parse_since, parse_tail, render, LogQuery};
use clap::Args;

use crate::app::App;

/// Log selection flags shared with `compose logs`.
#[derive(Args, Debug, Clone, Default)]
pub struct LogFlags {
    /// Follow log output
    #[arg(short = 'f', long)]
    pub follow: bool,

    /// Show timestamps
    #[arg(short = 't', long)]
    pub timestamps: bool,

    /// Show logs since timestamp (e.g. 2013-01-02T13:23:37Z) or relative (e.g. 42m)
    #[arg(long)]
    pub since: Option<String>,

    /// Show logs before a timestamp or relative time
    #[arg(long)]
    pub until: Option<String>,

    /// Number of lines to show from the end of the logs
    #[arg(short = 'n', long, default_value = "all")]
    pub tail: String,
}

impl LogFlags {
    pub fn query(&self) -> Result<LogQuery> {
        let now = chrono::Utc::now();
        Ok(LogQuery {
            follow: self.follow,
            tail: parse_tail(&self.tail)?,
            since: self.since.as_deref().map(|s| parse_since(s, now)).transpose()?,
            until: self.until.as_deref().map(|s| parse_since(s, now)).transpose()?,
            timestamps: self.timestamps,
        })
    }
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    #[command(flatten)]
    pub flags: LogFlags,

    /// Container name or ID
    pub container: String,
}

/// Write one entry to the stream it came from, after `prefix`.
pub(crate) fn print_entry(prefix: &str, entry: &LogEntry, timestamps: bool) -> Result<()> {
    let mut line = format!("{prefix}{}", render(entry, timestamps));
    if !line.ends_with('\n') {
        line.push('\n');
    }
    match entry.stream {
        LogStream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(line.as_bytes())?;
            out.flush()?;
        }
        LogStream::Stderr => std::io::stderr().lock().write_all(line.as_bytes())?,
    }
    Ok(())
}

pub async fn execute(app: &App, args: LogsArgs) -> Result<()> {
    let query = args.flags.query()?;
    let mgr = app.manager()?;
    let timestamps = query.timestamps;
    let res = mgr
        .logs(&args.container, &query, |entry| print_entry("", entry, timestamps))
        .await;
    match res {
        // Ctrl-C ends a follow.
        Err(cdbox_core::error::BoxError::Cancelled) if query.follow => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_from_flags() {
        let flags = LogFlags {
            tail: "5".into(),
            since: Some("10m".into()),
            ..LogFlags::default()
        };
        let q = flags.query().unwrap();
        assert_eq!(q.tail, Some(5));
        assert!(q.since.unwrap() < chrono::Utc::now());
        assert!(q.until.is_none());

        let bad = LogFlags {
            tail: "many".into(),
            ..LogFlags::default()
        };
        assert!(bad.query().is_err());
    }
}

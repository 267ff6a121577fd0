//! Reading logs back for the `logs` command.
//!
//! Dispatches on the driver persisted at create time. Only json-file and
//! journald can be read; filtering and following happen here.

use std::fs::File;
use std::future::Future;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::log::{LogConfig, LogDriver, LogEntry};

use super::{journald, json_file};

const FOLLOW_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub follow: bool,
    /// Last N entries; `None` means all.
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub timestamps: bool,
}

impl LogQuery {
    fn admits(&self, entry: &LogEntry) -> bool {
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        let Some(t) = entry.timestamp() else {
            return false;
        };
        self.since.map_or(true, |s| t >= s) && self.until.map_or(true, |u| t <= u)
    }
}

/// `--tail`: a number or `all`.
pub fn parse_tail(raw: &str) -> Result<Option<usize>> {
    if raw == "all" || raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| BoxError::invalid(format!("invalid --tail value {raw:?}")))
}

/// `--since`/`--until`: RFC 3339, unix seconds, or a duration before `now`.
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(secs) = raw.parse::<f64>() {
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        return DateTime::<Utc>::from_timestamp(whole, nanos)
            .ok_or_else(|| BoxError::invalid(format!("timestamp out of range: {raw}")));
    }
    let d = cdbox_core::units::parse_duration(raw)
        .map_err(|_| BoxError::invalid(format!("invalid time {raw:?}: expected RFC3339, unix seconds or a duration like 42m")))?;
    let d = chrono::Duration::from_std(d).map_err(|e| BoxError::invalid(e.to_string()))?;
    Ok(now - d)
}

/// How an entry is printed, with `--timestamps` prepending the time.
pub fn render(entry: &LogEntry, timestamps: bool) -> String {
    if timestamps {
        format!("{} {}", entry.time, entry.log)
    } else {
        entry.log.clone()
    }
}

fn tail_of(mut entries: Vec<LogEntry>, tail: Option<usize>) -> Vec<LogEntry> {
    if let Some(n) = tail {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }
    entries
}

/// The container whose logs are read.
#[derive(Debug, Clone)]
pub struct LogSource<'a> {
    pub state_dir: &'a Path,
    pub id: &'a str,
    pub name: &'a str,
}

/// Read a container's logs into `emit`. When following, `stopped`
/// resolving (the task exited) ends the stream after a final drain.
pub async fn read_logs<S>(
    source: &LogSource<'_>,
    query: &LogQuery,
    stopped: S,
    mut emit: impl FnMut(&LogEntry) -> Result<()> + Send,
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    let config = LogConfig::load(source.state_dir)?;
    match &config.driver {
        LogDriver::JsonFile => {
            let path = config.json_log_path(source.state_dir, source.id);
            read_json_file(&path, config.max_file(), query, stopped, &mut emit).await
        }
        LogDriver::Journald => {
            let identifier = config.tag(source.id, source.name);
            let args = journald::journalctl_args(
                &identifier,
                query.follow,
                query.tail,
                query.since,
                query.until,
            );
            let journal = journald::read(args, |entry| emit(entry));
            if query.follow {
                tokio::select! {
                    res = journal => res,
                    _ = stopped => Ok(()),
                }
            } else {
                journal.await
            }
        }
        other => Err(BoxError::Precondition(format!(
            "configured logging driver {other} does not support reading"
        ))),
    }
}

async fn read_json_file<S>(
    path: &Path,
    max_file: u32,
    query: &LogQuery,
    stopped: S,
    emit: &mut (impl FnMut(&LogEntry) -> Result<()> + Send),
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    if !query.follow {
        let entries: Vec<LogEntry> = json_file::read_all(path, max_file)?
            .into_iter()
            .filter(|e| query.admits(e))
            .collect();
        for entry in tail_of(entries, query.tail) {
            emit(&entry)?;
        }
        return Ok(());
    }

    // Rotated files are complete; the current one is read through a
    // follower so nothing written after the snapshot is lost.
    let mut entries = Vec::new();
    for file in json_file::log_files(path, max_file) {
        if file != path {
            entries.extend(json_file::read_file(&file)?);
        }
    }
    let mut follower = Follower::open(path)?;
    entries.extend(follower.drain()?);
    let entries: Vec<LogEntry> = entries.into_iter().filter(|e| query.admits(e)).collect();
    for entry in tail_of(entries, query.tail) {
        emit(&entry)?;
    }

    tokio::pin!(stopped);
    loop {
        let done = tokio::select! {
            _ = &mut stopped => true,
            _ = tokio::time::sleep(FOLLOW_POLL) => false,
        };
        for entry in follower.drain()? {
            if query.admits(&entry) {
                emit(&entry)?;
            }
        }
        if done {
            return Ok(());
        }
    }
}

/// Tails one json-file log across rotation and truncation.
struct Follower {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    inode: u64,
    partial: String,
}

impl Follower {
    fn open(path: &Path) -> Result<Self> {
        let mut follower = Self {
            path: path.to_path_buf(),
            reader: None,
            inode: 0,
            partial: String::new(),
        };
        follower.reopen()?;
        Ok(follower)
    }

    fn reopen(&mut self) -> Result<()> {
        match File::open(&self.path) {
            Ok(file) => {
                self.inode = file.metadata()?.ino();
                self.reader = Some(BufReader::new(file));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.reader = None,
            Err(e) => return Err(e.into()),
        }
        self.partial.clear();
        Ok(())
    }

    fn read_available(&mut self, out: &mut Vec<LogEntry>) -> Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            if !line.ends_with('\n') {
                // Writer is mid-line; keep it for the next pass.
                self.partial.push_str(&line);
                return Ok(());
            }
            let full = std::mem::take(&mut self.partial) + &line;
            if let Some(entry) = json_file::parse_line(full.trim_end()) {
                out.push(entry);
            }
        }
    }

    /// Rotated files newer than the one being read, oldest first. When that
    /// file has already been rotated off the end, every rotated file is newer.
    fn rotated_since(&self) -> Vec<PathBuf> {
        let mut newer = Vec::new();
        for index in 1.. {
            let path = json_file::rotated_path(&self.path, index);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.ino() == self.inode => break,
                Ok(_) => newer.push(path),
                Err(_) => break,
            }
        }
        newer.reverse();
        newer
    }

    fn drain(&mut self) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        self.read_available(&mut out)?;
        match std::fs::metadata(&self.path) {
            Ok(meta) if self.reader.is_none() || meta.ino() != self.inode => {
                // Rotated: the old file is fully drained above. Files rotated
                // out after it are complete and come next, oldest first.
                for path in self.rotated_since() {
                    out.extend(json_file::read_file(&path)?);
                }
                self.reopen()?;
                self.read_available(&mut out)?;
            }
            Ok(meta) => {
                if let Some(reader) = self.reader.as_mut() {
                    let pos = reader.stream_position()?;
                    if meta.len() < pos {
                        // Truncated in place (max-file 1).
                        reader.seek(SeekFrom::Start(0))?;
                        self.partial.clear();
                        self.read_available(&mut out)?;
                    }
                }
            }
            Err(_) => {}
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbox_core::log::LogStream;
    use crate::logging::json_file::JsonFileSink;
    use crate::logging::LogSink;
    use tempfile::TempDir;

    fn entry_at(secs: i64, log: &str) -> LogEntry {
        LogEntry {
            log: log.to_string(),
            stream: LogStream::Stdout,
            time: DateTime::<Utc>::from_timestamp(secs, 0)
                .unwrap()
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }

    fn setup(dir: &Path, driver: &str) -> LogConfig {
        let config = LogConfig::from_flags(Some(driver), &[]).unwrap();
        config.save(dir).unwrap();
        config
    }

    #[test]
    fn test_parse_since_forms() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(parse_since("42m", now).unwrap(), now - chrono::Duration::minutes(42));
        assert_eq!(parse_since("1600000000", now).unwrap().timestamp(), 1_600_000_000);
        assert_eq!(
            parse_since("2024-01-02T03:04:05Z", now).unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert!(parse_since("yesterday", now).is_err());
    }

    #[test]
    fn test_parse_tail() {
        assert_eq!(parse_tail("all").unwrap(), None);
        assert_eq!(parse_tail("5").unwrap(), Some(5));
        assert!(parse_tail("-1").is_err());
    }

    #[test]
    fn test_render_timestamps() {
        let e = entry_at(0, "x\n");
        assert_eq!(render(&e, false), "x\n");
        assert!(render(&e, true).starts_with("1970-01-01T00:00:00"));
    }

    #[tokio::test]
    async fn test_tail_and_since_filters() {
        let dir = TempDir::new().unwrap();
        let config = setup(dir.path(), "json-file");
        let id = "c".repeat(64);
        let mut sink = JsonFileSink::open(&config.json_log_path(dir.path(), &id), None, 1).unwrap();
        for i in 0..5 {
            sink.write(&entry_at(1_000 + i, &format!("{i}\n"))).unwrap();
        }
        sink.close().unwrap();

        let source = LogSource { state_dir: dir.path(), id: &id, name: "web" };
        let mut got = Vec::new();
        let query = LogQuery { tail: Some(2), ..Default::default() };
        read_logs(&source, &query, std::future::pending(), |e| {
            got.push(e.log.clone());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(got, vec!["3\n", "4\n"]);

        let mut got = Vec::new();
        let query = LogQuery {
            since: DateTime::<Utc>::from_timestamp(1_001, 0),
            until: DateTime::<Utc>::from_timestamp(1_003, 0),
            ..Default::default()
        };
        read_logs(&source, &query, std::future::pending(), |e| {
            got.push(e.log.clone());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(got, vec!["1\n", "2\n", "3\n"]);
    }

    #[tokio::test]
    async fn test_unreadable_driver() {
        let dir = TempDir::new().unwrap();
        setup(dir.path(), "fluentd");
        let source = LogSource { state_dir: dir.path(), id: "abc", name: "web" };
        let err = read_logs(&source, &LogQuery::default(), std::future::pending(), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not support reading"));
    }

    #[tokio::test]
    async fn test_follow_streams_until_stopped() {
        let dir = TempDir::new().unwrap();
        let config = setup(dir.path(), "json-file");
        let id = "d".repeat(64);
        let path = config.json_log_path(dir.path(), &id);
        let mut sink = JsonFileSink::open(&path, None, 1).unwrap();
        sink.write(&LogEntry::now(LogStream::Stdout, "first\n")).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            sink.write(&LogEntry::now(LogStream::Stdout, "second\n")).unwrap();
            sink.close().unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(());
        });

        let source = LogSource { state_dir: dir.path(), id: &id, name: "web" };
        let query = LogQuery { follow: true, ..Default::default() };
        let mut got = Vec::new();
        read_logs(&source, &query, async { let _ = rx.await; }, |e| {
            got.push(e.log.clone());
            Ok(())
        })
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(got, vec!["first\n", "second\n"]);
    }

    #[tokio::test]
    async fn test_follow_survives_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let mut writer = json_file::RotatingWriter::new(&path, Some(60), 2).unwrap();
        let line = |n: u32| serde_json::to_string(&LogEntry::now(LogStream::Stdout, format!("{n}\n"))).unwrap();
        writer.write_line(&line(0)).unwrap();

        let mut follower = Follower::open(&path).unwrap();
        assert_eq!(follower.drain().unwrap().len(), 1);
        for n in 1..4 {
            writer.write_line(&line(n)).unwrap();
        }
        let logs: Vec<String> = follower.drain().unwrap().into_iter().map(|e| e.log).collect();
        assert_eq!(logs.last().map(String::as_str), Some("3\n"));
    }

    #[tokio::test]
    async fn test_follow_reads_every_file_rotated_between_polls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        // Every line fills a file, so each write after the first rotates.
        let mut writer = json_file::RotatingWriter::new(&path, Some(60), 4).unwrap();
        let line = |n: u32| serde_json::to_string(&LogEntry::now(LogStream::Stdout, format!("{n}\n"))).unwrap();
        writer.write_line(&line(0)).unwrap();

        let mut follower = Follower::open(&path).unwrap();
        assert_eq!(follower.drain().unwrap().len(), 1);
        for n in 1..4 {
            writer.write_line(&line(n)).unwrap();
        }
        assert!(json_file::rotated_path(&path, 3).exists());
        let logs: Vec<String> = follower.drain().unwrap().into_iter().map(|e| e.log).collect();
        assert_eq!(logs, vec!["1\n", "2\n", "3\n"]);

        writer.write_line(&line(4)).unwrap();
        let logs: Vec<String> = follower.drain().unwrap().into_iter().map(|e| e.log).collect();
        assert_eq!(logs, vec!["4\n"]);
    }
}

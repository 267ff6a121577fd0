//! json-file driver: one Docker-compatible JSON object per line, with
//! size-based rotation.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use cdbox_core::error::Result;
use cdbox_core::log::LogEntry;

use super::LogSink;

/// Appends lines and rotates once the current file would exceed `max_size`.
///
/// At most `max_file` files exist: the current one plus `.1` .. `.N-1`,
/// `.1` being the newest rotated file. With `max_file == 1` the current
/// file is truncated instead. No `max_size` means no rotation.
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    written: u64,
    max_size: Option<u64>,
    max_file: u32,
}

impl RotatingWriter {
    pub fn new(path: &Path, max_size: Option<u64>, max_file: u32) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_size,
            max_file: max_file.max(1),
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if let Some(max) = self.max_size {
            if self.written > 0 && self.written + len > max {
                self.rotate()?;
            }
        }
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf)?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        if self.max_file > 1 {
            // .N-2 -> .N-1, ..., .1 -> .2; the old .N-1 is overwritten.
            for i in (1..self.max_file - 1).rev() {
                let from = rotated_path(&self.path, i);
                if from.exists() {
                    std::fs::rename(&from, rotated_path(&self.path, i + 1))?;
                }
            }
            std::fs::rename(&self.path, rotated_path(&self.path, 1))?;
        }
        self.file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

/// `container-json.log` -> `container-json.log.1`
pub fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(format!(".{index}"));
    PathBuf::from(p)
}

/// Every file of a log, oldest first.
pub fn log_files(path: &Path, max_file: u32) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = (1..max_file.max(1))
        .rev()
        .map(|i| rotated_path(path, i))
        .filter(|p| p.exists())
        .collect();
    if path.exists() {
        files.push(path.to_path_buf());
    }
    files
}

/// Parse one log line; malformed lines are skipped by callers.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    serde_json::from_str(line).ok()
}

/// Read every entry of one file. A missing file reads as empty.
pub fn read_file(path: &Path) -> Result<Vec<LogEntry>> {
    let reader = match std::fs::File::open(path) {
        Ok(f) => BufReader::new(f),
        // Rotated away between listing and open.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in reader.lines() {
        if let Some(entry) = parse_line(&line?) {
            out.push(entry);
        }
    }
    Ok(out)
}

/// Read every entry across rotated files, oldest first.
pub fn read_all(path: &Path, max_file: u32) -> Result<Vec<LogEntry>> {
    let mut out = Vec::new();
    for file in log_files(path, max_file) {
        out.extend(read_file(&file)?);
    }
    Ok(out)
}

pub struct JsonFileSink {
    writer: RotatingWriter,
}

impl JsonFileSink {
    pub fn open(path: &Path, max_size: Option<u64>, max_file: u32) -> Result<Self> {
        Ok(Self {
            writer: RotatingWriter::new(path, max_size, max_file)?,
        })
    }
}

impl LogSink for JsonFileSink {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        self.writer.write_line(&line)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbox_core::log::LogStream;
    use tempfile::TempDir;

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let mut sink = JsonFileSink::open(&path, None, 1).unwrap();
        sink.write(&LogEntry::now(LogStream::Stdout, "hello\n")).unwrap();
        sink.write(&LogEntry::now(LogStream::Stderr, "oops\n")).unwrap();
        sink.close().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["log"], "hello\n");
        assert_eq!(first["stream"], "stdout");
        assert!(first["time"].as_str().unwrap().ends_with('Z'));

        let entries = read_all(&path, 1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].stream, LogStream::Stderr);
    }

    #[test]
    fn test_rotation_bounds_file_count_and_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let max = 100;
        let mut writer = RotatingWriter::new(&path, Some(max), 3).unwrap();
        let line = "x".repeat(39);
        for _ in 0..50 {
            writer.write_line(&line).unwrap();
        }
        assert_eq!(files_in(dir.path()), 3);
        assert!(rotated_path(&path, 2).exists());
        assert!(!rotated_path(&path, 3).exists());
        let total: u64 = log_files(&path, 3)
            .iter()
            .map(|p| std::fs::metadata(p).unwrap().len())
            .sum();
        assert!(total <= 3 * max);
    }

    #[test]
    fn test_single_file_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let mut writer = RotatingWriter::new(&path, Some(50), 1).unwrap();
        for i in 0..10 {
            writer.write_line(&format!("line-{i:02}-padding-padding")).unwrap();
        }
        assert_eq!(files_in(dir.path()), 1);
        assert!(std::fs::metadata(&path).unwrap().len() <= 50);
        assert!(std::fs::read_to_string(&path).unwrap().contains("line-09"));
    }

    #[test]
    fn test_no_max_size_never_rotates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let mut writer = RotatingWriter::new(&path, None, 5).unwrap();
        for _ in 0..100 {
            writer.write_line("some log line").unwrap();
        }
        assert_eq!(files_in(dir.path()), 1);
    }

    #[test]
    fn test_read_all_orders_rotated_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c-json.log");
        let mut sink = JsonFileSink::open(&path, Some(80), 4).unwrap();
        for i in 0..6 {
            sink.write(&LogEntry::now(LogStream::Stdout, format!("{i}\n"))).unwrap();
        }
        let logs: Vec<String> = read_all(&path, 4).unwrap().into_iter().map(|e| e.log).collect();
        let n = logs.len();
        assert!(n >= 3);
        assert_eq!(logs.last().unwrap(), "5\n");
        let nums: Vec<u32> = logs.iter().map(|l| l.trim().parse().unwrap()).collect();
        assert!(nums.windows(2).all(|w| w[0] < w[1]));
    }
}

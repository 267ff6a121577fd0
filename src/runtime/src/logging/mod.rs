//! Container logging pipeline.
//!
//! The task monitor owns a [`producer::LogProducer`] that splits the
//! container's stdout/stderr into entries and hands them to the configured
//! [`LogSink`]. The `logs` command reads them back through [`consumer`].

pub mod binary;
pub mod consumer;
pub mod fluentd;
pub mod journald;
pub mod json_file;
pub mod producer;

use std::path::Path;

use cdbox_core::error::Result;
use cdbox_core::log::{LogConfig, LogDriver, LogEntry};

/// Destination of a container's log entries.
pub trait LogSink: Send {
    fn write(&mut self, entry: &LogEntry) -> Result<()>;

    /// Flush and release the destination.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Identity of the container whose output is being logged.
#[derive(Debug, Clone)]
pub struct LogTarget<'a> {
    pub namespace: &'a str,
    pub id: &'a str,
    pub name: &'a str,
    pub state_dir: &'a Path,
}

/// Open the sink for a container's configured driver. `none` has no sink.
pub fn open_sink(config: &LogConfig, target: &LogTarget<'_>) -> Result<Option<Box<dyn LogSink>>> {
    let sink: Box<dyn LogSink> = match &config.driver {
        LogDriver::None => return Ok(None),
        LogDriver::JsonFile => Box::new(json_file::JsonFileSink::open(
            &config.json_log_path(target.state_dir, target.id),
            config.max_size(),
            config.max_file(),
        )?),
        LogDriver::Journald => Box::new(journald::JournaldSink::connect(journald::JournalFields {
            identifier: config.tag(target.id, target.name),
            container_id: target.id.to_string(),
            container_name: target.name.to_string(),
        })?),
        LogDriver::Fluentd => Box::new(fluentd::FluentdSink::new(config, target.id, target.name)?),
        LogDriver::Binary(path) => Box::new(binary::BinarySink::spawn(path, config, target)?),
    };
    tracing::debug!(driver = %config.driver, id = target.id, "opened log sink");
    Ok(Some(sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbox_core::log::LogStream;
    use tempfile::TempDir;

    #[test]
    fn test_open_sink_none() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::from_flags(Some("none"), &[]).unwrap();
        let target = LogTarget { namespace: "default", id: "abc", name: "web", state_dir: dir.path() };
        assert!(open_sink(&config, &target).unwrap().is_none());
    }

    #[test]
    fn test_open_sink_json_file_writes_under_state_dir() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::default();
        let id = "f".repeat(64);
        let target = LogTarget { namespace: "default", id: &id, name: "web", state_dir: dir.path() };
        let mut sink = open_sink(&config, &target).unwrap().unwrap();
        sink.write(&LogEntry::now(LogStream::Stdout, "hi\n")).unwrap();
        sink.close().unwrap();
        let path = config.json_log_path(dir.path(), &id);
        assert!(std::fs::read_to_string(path).unwrap().contains("\"log\":\"hi\\n\""));
    }
}

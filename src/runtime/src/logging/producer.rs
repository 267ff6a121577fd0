//! Splits raw container output into log entries.

use cdbox_core::error::Result;
use cdbox_core::log::{LogEntry, LogStream};

use super::LogSink;

/// Lines longer than this are emitted in pieces.
pub const MAX_LINE: usize = 16 * 1024;

/// Buffers partial lines per stream and feeds complete ones to a sink.
pub struct LogProducer {
    sink: Option<Box<dyn LogSink>>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LogProducer {
    pub fn new(sink: Option<Box<dyn LogSink>>) -> Self {
        Self {
            sink,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Accept a chunk read from one of the container's streams.
    pub fn push(&mut self, stream: LogStream, chunk: &[u8]) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let buf = match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(chunk);
        loop {
            let cut = match buf.iter().position(|b| *b == b'\n') {
                Some(i) if i < MAX_LINE => i + 1,
                _ if buf.len() >= MAX_LINE => MAX_LINE,
                _ => break,
            };
            let line: Vec<u8> = buf.drain(..cut).collect();
            sink.write(&LogEntry::now(stream, String::from_utf8_lossy(&line)))?;
        }
        Ok(())
    }

    /// Emit whatever is buffered and close the sink.
    pub fn finish(&mut self) -> Result<()> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        for (stream, buf) in [
            (LogStream::Stdout, std::mem::take(&mut self.stdout)),
            (LogStream::Stderr, std::mem::take(&mut self.stderr)),
        ] {
            if !buf.is_empty() {
                sink.write(&LogEntry::now(stream, String::from_utf8_lossy(&buf)))?;
            }
        }
        sink.close()
    }
}

impl Drop for LogProducer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(error = %e, "failed to flush container logs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<LogEntry>>>, Arc<Mutex<bool>>);

    impl LogSink for Collect {
        fn write(&mut self, entry: &LogEntry) -> Result<()> {
            self.0.lock().unwrap().push(entry.clone());
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            *self.1.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn test_splits_lines_across_chunks() {
        let sink = Collect::default();
        let mut producer = LogProducer::new(Some(Box::new(sink.clone())));
        producer.push(LogStream::Stdout, b"hel").unwrap();
        producer.push(LogStream::Stdout, b"lo\nwor").unwrap();
        producer.push(LogStream::Stderr, b"err\n").unwrap();
        producer.push(LogStream::Stdout, b"ld\n").unwrap();
        let logs: Vec<(LogStream, String)> =
            sink.0.lock().unwrap().iter().map(|e| (e.stream, e.log.clone())).collect();
        assert_eq!(
            logs,
            vec![
                (LogStream::Stdout, "hello\n".to_string()),
                (LogStream::Stderr, "err\n".to_string()),
                (LogStream::Stdout, "world\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_long_line_is_split() {
        let sink = Collect::default();
        let mut producer = LogProducer::new(Some(Box::new(sink.clone())));
        let mut data = vec![b'x'; MAX_LINE + 10];
        data.push(b'\n');
        producer.push(LogStream::Stdout, &data).unwrap();
        let entries = sink.0.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log.len(), MAX_LINE);
        assert_eq!(entries[1].log.len(), 11);
    }

    #[test]
    fn test_finish_flushes_partial_and_closes() {
        let sink = Collect::default();
        let mut producer = LogProducer::new(Some(Box::new(sink.clone())));
        producer.push(LogStream::Stdout, b"no newline").unwrap();
        assert!(sink.0.lock().unwrap().is_empty());
        producer.finish().unwrap();
        assert_eq!(sink.0.lock().unwrap()[0].log, "no newline");
        assert!(*sink.1.lock().unwrap());
    }

    #[test]
    fn test_disabled_producer_discards() {
        let mut producer = LogProducer::new(None);
        assert!(!producer.is_enabled());
        producer.push(LogStream::Stdout, b"ignored\n").unwrap();
        producer.finish().unwrap();
    }
}

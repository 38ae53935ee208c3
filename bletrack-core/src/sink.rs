//! Persistence boundary for capture records.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::types::{CaptureRecord, SinkError};

/// Append-only store for capture records.
///
/// A failed `store` loses only that record; callers keep going.
pub trait CaptureSink {
    fn store(&mut self, record: &CaptureRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: CaptureSink + ?Sized> CaptureSink for Box<S> {
    fn store(&mut self, record: &CaptureRecord) -> Result<(), SinkError> {
        (**self).store(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Discards everything. Used by `dump` and offline decoding.
#[derive(Debug, Default)]
pub struct NullSink;

impl CaptureSink for NullSink {
    fn store(&mut self, _record: &CaptureRecord) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one JSON document per line.
pub struct JsonLinesSink<W: Write> {
    out: W,
    written: u64,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesSink::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> CaptureSink for JsonLinesSink<W> {
    fn store(&mut self, record: &CaptureRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(record)?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameHeader};

    fn record(seq: u8) -> CaptureRecord {
        let frame = Frame {
            header: FrameHeader {
                sequence: seq,
                adv_raw_count: 3,
                mac_count: 0,
            },
            devices: vec![],
            sequence_gap: false,
        };
        CaptureRecord::new(frame, None, 1_700_000_000.0)
    }

    #[test]
    fn test_json_lines_in_memory() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.store(&record(1)).unwrap();
        sink.store(&record(2)).unwrap();
        assert_eq!(sink.written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["sequence"], 2);
        assert!(doc["gps"].is_null());
    }

    #[test]
    fn test_json_lines_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captures.ndjson");

        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.store(&record(1)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.store(&record(2)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_boxed_sink() {
        let mut sink: Box<dyn CaptureSink> = Box::new(NullSink);
        assert!(sink.store(&record(0)).is_ok());
        assert!(sink.flush().is_ok());
    }
}

//! Downstream sinks for assembled log records.
//!
//! The reactor hands every completed frame payload to a [`Collector`] by
//! value; the collector owns the bytes from then on. Hand-off is
//! fire-and-forget: a collector that cannot store a record logs the failure
//! and carries on, it never reports back into connection handling.
//!
//! The spool keeps the wire framing: every record is written behind its own
//! 4-byte big-endian length, so payloads may contain any bytes, newlines
//! included, and a reader recovers exactly the records that were appended.

use crate::protocol::encode_header;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Destination for completed records.
pub trait Collector {
    /// Take ownership of one record payload.
    fn append(&mut self, record: Bytes);

    /// Push out anything buffered. Called once per reactor iteration.
    fn flush(&mut self) {}
}

impl Collector for Vec<Bytes> {
    fn append(&mut self, record: Bytes) {
        self.push(record);
    }
}

/// Errors opening a spool destination.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to open spool file '{shown}': {source}", shown = .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Collector that appends length-prefixed records to a writer.
pub struct Spool<W: Write> {
    out: BufWriter<W>,
    timestamps: bool,
    records: u64,
    bytes: u64,
    /// Records appended since the last flush.
    pending: u64,
}

impl Spool<Box<dyn Write + Send>> {
    /// Open a spool on `target`: `-` for stdout, otherwise a file path
    /// opened for appending.
    pub fn open(target: &str, timestamps: bool) -> Result<Self, CollectorError> {
        let out: Box<dyn Write + Send> = if target == "-" {
            Box::new(io::stdout())
        } else {
            let path = PathBuf::from(target);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| CollectorError::Open { path, source })?;
            Box::new(file)
        };

        Ok(Spool::new(out, timestamps))
    }
}

impl<W: Write> Spool<W> {
    /// Wrap `out`, optionally prefixing each record with its arrival time.
    pub fn new(out: W, timestamps: bool) -> Self {
        Self {
            out: BufWriter::new(out),
            timestamps,
            records: 0,
            bytes: 0,
            pending: 0,
        }
    }

    /// Number of records accepted.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Total payload bytes accepted.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Write one frame: length, optional `<timestamp> ` prefix, payload.
    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        let stamp = self
            .timestamps
            .then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) + " ");
        let prefix = stamp.as_deref().unwrap_or_default().as_bytes();

        self.out.write_all(&encode_header(prefix.len() + record.len())?)?;
        self.out.write_all(prefix)?;
        self.out.write_all(record)
    }

    /// Recover the inner writer, flushing buffered records.
    #[cfg(test)]
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(e) => panic!("spool flush failed: {}", e.error()),
        }
    }
}

impl<W: Write> Collector for Spool<W> {
    fn append(&mut self, record: Bytes) {
        self.records += 1;
        self.bytes += record.len() as u64;
        self.pending += 1;

        if let Err(e) = self.write_record(&record) {
            warn!(error = %e, len = record.len(), "Failed to spool record");
        }
    }

    fn flush(&mut self) {
        if self.pending == 0 {
            return;
        }

        let flushed = std::mem::take(&mut self.pending);
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "Failed to flush spool");
        } else {
            debug!(
                flushed,
                records = self.records,
                bytes = self.bytes,
                "Spool flushed"
            );
        }
    }
}

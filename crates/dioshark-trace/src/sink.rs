//! Destinations for decoded records.
//!
//! Workers hand every decoded record to a shared [`RecordSink`].  Sinks are
//! called concurrently from all worker threads; ordering is only preserved
//! per channel.

use crate::record::TraceRecord;
use log::{info, warn};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub trait RecordSink: Send + Sync {
    /// Called once per decoded record.
    fn emit(&self, worker: usize, device: &str, record: &TraceRecord);
}

/// Logs each record at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn emit(&self, worker: usize, device: &str, record: &TraceRecord) {
        info!("{:<8} w{:<3} {}", device, worker, record);
    }
}

/// Counts records without keeping them.
#[derive(Debug, Default)]
pub struct CountingSink {
    count: AtomicU64,
}

impl CountingSink {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl RecordSink for CountingSink {
    fn emit(&self, _worker: usize, _device: &str, _record: &TraceRecord) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Writes one text line per record.
pub struct WriterSink<W: Write + Send> {
    out: Mutex<W>,
    failed: AtomicBool,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            failed: AtomicBool::new(false),
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> RecordSink for WriterSink<W> {
    fn emit(&self, worker: usize, device: &str, record: &TraceRecord) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{:<8} w{:<3} {}", device, worker, record) {
            // Only the first failure is logged; a broken output would
            // otherwise flood the log once per record.
            if !self.failed.swap(true, Ordering::Relaxed) {
                warn!("Failed to write record: {}", e);
            }
        }
    }
}

/// A record as delivered to a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emitted {
    pub worker: usize,
    pub device: String,
    pub record: TraceRecord,
}

/// Keeps every record in memory until drained.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Emitted>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every collected record, clearing the buffer.
    pub fn drain(&self) -> Vec<Emitted> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, worker: usize, device: &str, record: &TraceRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Emitted {
                worker,
                device: device.to_owned(),
                record: *record,
            });
    }
}

//! Collector workers.
//!
//! One worker runs per CPU.  It opens that CPU's channel of every traced
//! device, reports READY, waits at the start gate, then drains its channels
//! until its running flag is cleared, the channels run dry, or an I/O error
//! makes it SICK.
//!
//! ```text
//! (opening) ──▶ READY ──gate──▶ WORKING ──▶ DONE
//!     │                            │
//!     └──open failed               └──wait/read error──▶ SICK
//! ```

use crate::channel::ChannelSet;
use crate::error::TraceError;
use crate::pool::PoolShared;
use crate::record::TraceRecord;
use crate::sink::RecordSink;
use crate::verified::drain::{
    channels_exhausted, classify_read, final_state, next_empty_count, LoopExit, ReadOutcome,
};
use dioshark_protocol::RECORD_SIZE;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Ready,
    Working,
    Done,
    Sick,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Working => "WORKING",
            Self::Done => "DONE",
            Self::Sick => "SICK",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The part of a worker visible to other threads.
#[derive(Debug)]
pub struct WorkerShared {
    id: usize,
    running: AtomicBool,
    /// `None` while the worker is still opening its channels.
    state: Mutex<Option<WorkerState>>,
}

impl WorkerShared {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            running: AtomicBool::new(true),
            state: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag.  The worker exits within one poll timeout.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Current state, or `None` until the channel open has finished.
    pub fn state(&self) -> Option<WorkerState> {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.lock_state() = Some(state);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, Option<WorkerState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Final accounting for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub state: WorkerState,
    pub records: u64,
    pub malformed: u64,
    pub empty_reads: u64,
    pub last_error: Option<String>,
}

impl WorkerStatus {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: WorkerState::Ready,
            records: 0,
            malformed: 0,
            empty_reads: 0,
            last_error: None,
        }
    }

    fn fail(&mut self, err: &TraceError) {
        self.last_error = Some(err.to_string());
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {}: {}, {} records, {} malformed, {} empty reads",
            self.id, self.state, self.records, self.malformed, self.empty_reads
        )?;
        if let Some(err) = &self.last_error {
            write!(f, ", last error: {}", err)?;
        }
        Ok(())
    }
}

/// Loop tunables.
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub poll_timeout: Duration,
    pub empty_read_limit: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Thread body
// ═══════════════════════════════════════════════════════════════════════

/// Everything a worker thread takes ownership of.
pub(crate) struct WorkerContext {
    pub shared: Arc<WorkerShared>,
    pub pool: Arc<PoolShared>,
    pub devices: Arc<[String]>,
    pub debugfs_root: PathBuf,
    pub settings: DrainSettings,
    pub sink: Arc<dyn RecordSink>,
    pub ready: SyncSender<WorkerState>,
}

pub(crate) fn run(ctx: WorkerContext) -> WorkerStatus {
    let id = ctx.shared.id();
    let mut status = WorkerStatus::new(id);

    let mut channels = match ChannelSet::open(&ctx.debugfs_root, &ctx.devices, id) {
        Ok(channels) => channels,
        Err(err) => {
            error!("Worker {}: {}", id, err);
            status.fail(&err);
            status.state = WorkerState::Sick;
            ctx.shared.set_state(WorkerState::Sick);
            let _ = ctx.ready.send(WorkerState::Sick);
            return status;
        }
    };
    ctx.shared.set_state(WorkerState::Ready);
    let _ = ctx.ready.send(WorkerState::Ready);
    debug!("Worker {} ready with {} channels", id, channels.len());

    ctx.pool.gate().wait();
    ctx.shared.set_state(WorkerState::Working);
    ctx.pool.mark_running();

    let exit = drain(
        &mut channels,
        &ctx.shared,
        ctx.settings,
        ctx.sink.as_ref(),
        &mut status,
    );
    drop(channels);

    status.state = final_state(exit);
    ctx.shared.set_state(status.state);
    debug!("Worker {} finished: {:?}", id, exit);
    status
}

// ═══════════════════════════════════════════════════════════════════════
//  Drain loop
// ═══════════════════════════════════════════════════════════════════════

/// Drain `channels` until told to stop, exhausted, or failed.
pub(crate) fn drain(
    channels: &mut ChannelSet,
    shared: &WorkerShared,
    settings: DrainSettings,
    sink: &dyn RecordSink,
    status: &mut WorkerStatus,
) -> LoopExit {
    let id = shared.id();
    let mut empty: u32 = 0;
    let mut buf = [0u8; RECORD_SIZE];

    while shared.is_running() {
        let readable = match channels.wait_readable(settings.poll_timeout) {
            Ok(readable) => readable,
            Err(source) => {
                let err = TraceError::WaitFailed(source);
                error!("Worker {}: {}", id, err);
                status.fail(&err);
                return LoopExit::Failed;
            }
        };

        for index in readable {
            let n = match channels.read(index, &mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(source) => {
                    let err = TraceError::ReadFailed {
                        channel: channel_label(channels, index),
                        source,
                    };
                    error!("Worker {}: {}", id, err);
                    status.fail(&err);
                    return LoopExit::Failed;
                }
            };

            empty = next_empty_count(empty, n);
            match classify_read(n) {
                ReadOutcome::Empty => status.empty_reads += 1,
                ReadOutcome::Short(len) => {
                    let err = TraceError::MalformedRecord { len };
                    warn!("Worker {}: {} from {}", id, err, channel_label(channels, index));
                    status.malformed += 1;
                    status.fail(&err);
                }
                ReadOutcome::Record => {
                    let record = match TraceRecord::decode(&buf[..n]) {
                        Ok(record) => record,
                        Err(err) => {
                            warn!("Worker {}: {}", id, err);
                            status.malformed += 1;
                            continue;
                        }
                    };
                    if !record.has_valid_magic() {
                        let err = TraceError::BadMagic {
                            channel: channel_label(channels, index),
                            magic: record.magic,
                        };
                        warn!("Worker {}: {}", id, err);
                        status.malformed += 1;
                        status.fail(&err);
                        continue;
                    }
                    if record.pdu_len > 0 {
                        if let Err(source) = skip_payload(channels, index, record.pdu_len) {
                            let err = TraceError::ReadFailed {
                                channel: channel_label(channels, index),
                                source,
                            };
                            error!("Worker {}: {}", id, err);
                            status.fail(&err);
                            return LoopExit::Failed;
                        }
                    }
                    let device = channels.get(index).map_or("?", |c| c.device());
                    sink.emit(id, device, &record);
                    status.records += 1;
                }
            }

            if channels_exhausted(empty, settings.empty_read_limit) {
                info!(
                    "Worker {}: channels drained after {} records",
                    id, status.records
                );
                return LoopExit::Exhausted;
            }
        }
    }
    LoopExit::Stopped
}

/// Consume the payload that follows a record header on channel `index`.
fn skip_payload(channels: &mut ChannelSet, index: usize, len: u16) -> io::Result<()> {
    let skipped = channels.skip(index, usize::from(len))?;
    if skipped < usize::from(len) {
        warn!(
            "Short payload on {}: {} of {} bytes",
            channel_label(channels, index),
            skipped,
            len
        );
    }
    Ok(())
}

fn channel_label(channels: &ChannelSet, index: usize) -> String {
    channels
        .get(index)
        .map_or_else(|| format!("channel {index}"), |c| c.label())
}

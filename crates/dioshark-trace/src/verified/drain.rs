//! Pure, verifiable functions for the collector drain loop.
//!
//! These carry the per-read and per-exit decisions of `worker.rs` so the
//! loop itself only performs I/O.

use crate::worker::WorkerState;
use dioshark_protocol::RECORD_SIZE;

// ─── Reads ──────────────────────────────────────────────────────────

/// What a single `read(2)` of `n` bytes produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing to read.
    Empty,
    /// Fewer bytes than a record; the record is dropped.
    Short(usize),
    /// A full record.
    Record,
}

/// Classify the byte count returned by a channel read.
pub fn classify_read(n: usize) -> ReadOutcome {
    match n {
        0 => ReadOutcome::Empty,
        n if n < RECORD_SIZE => ReadOutcome::Short(n),
        _ => ReadOutcome::Record,
    }
}

/// Advance the consecutive empty-read counter after a read of `n` bytes.
///
/// Any non-empty read resets the counter, including a short one.
///
/// # Properties
///
/// - `n > 0  ⟹  result == 0`
/// - `n == 0 ⟹  result == count + 1` (saturating)
pub fn next_empty_count(count: u32, n: usize) -> u32 {
    let result = if n == 0 { count.saturating_add(1) } else { 0 };

    debug_assert!(n == 0 || result == 0);

    result
}

/// Whether `count` consecutive empty reads mean the channels are drained.
///
/// A `limit` of 0 disables exhaustion; the worker then only stops when its
/// running flag is cleared.
pub fn channels_exhausted(count: u32, limit: u32) -> bool {
    limit != 0 && count >= limit
}

// ─── Exit ───────────────────────────────────────────────────────────

/// Why a worker left its drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The running flag was cleared.
    Stopped,
    /// The empty-read limit was reached.
    Exhausted,
    /// A wait or read error.
    Failed,
}

/// Final worker state for a loop exit.
pub fn final_state(exit: LoopExit) -> WorkerState {
    match exit {
        LoopExit::Stopped | LoopExit::Exhausted => WorkerState::Done,
        LoopExit::Failed => WorkerState::Sick,
    }
}

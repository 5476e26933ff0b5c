//! The per-CPU worker pool and its two barriers.
//!
//! # Launch
//!
//! Workers are spawned one at a time.  After each spawn the pool blocks on
//! that worker's readiness channel; the worker answers READY once its
//! channels are open, or SICK.  The first SICK answer ends the launch with
//! [`TraceError::LaunchIncomplete`].
//!
//! # Start
//!
//! READY workers park on a single-shot [`StartGate`].  The session opens it
//! once device start has been attempted, then waits (bounded) until every
//! READY worker has reported itself WORKING.

use crate::error::TraceError;
use crate::sink::RecordSink;
use crate::worker::{self, DrainSettings, WorkerContext, WorkerShared, WorkerState, WorkerStatus};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════
//  Start gate
// ═══════════════════════════════════════════════════════════════════════

/// A gate that opens once and stays open.
#[derive(Debug, Default)]
pub struct StartGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl StartGate {
    /// Block until the gate is open.
    pub fn wait(&self) {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let _open = self
            .cond
            .wait_while(open, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Open the gate, waking every waiter.  Later calls are no-ops.
    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            *open = true;
            self.cond.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    created: usize,
    running: usize,
}

/// State shared between the pool and its worker threads.
#[derive(Debug, Default)]
pub struct PoolShared {
    counts: Mutex<Counts>,
    counts_changed: Condvar,
    gate: StartGate,
}

impl PoolShared {
    pub fn gate(&self) -> &StartGate {
        &self.gate
    }

    pub fn created(&self) -> usize {
        self.lock_counts().created
    }

    pub fn running(&self) -> usize {
        self.lock_counts().running
    }

    fn lock_counts(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_created(&self) {
        self.lock_counts().created += 1;
    }

    /// Called by a worker right after it passes the gate.
    pub(crate) fn mark_running(&self) {
        let mut counts = self.lock_counts();
        counts.running += 1;
        debug_assert!(counts.running <= counts.created);
        self.counts_changed.notify_all();
    }

    /// Wait until `expected` workers are running, at most `timeout`.
    pub(crate) fn await_running(&self, expected: usize, timeout: Duration) -> Result<(), TraceError> {
        let counts = self.lock_counts();
        let (counts, result) = self
            .counts_changed
            .wait_timeout_while(counts, timeout, |c| c.running < expected)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && counts.running < expected {
            return Err(TraceError::StartTimeout {
                running: counts.running,
                expected,
                timeout,
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    workers: Mutex<Vec<Arc<WorkerShared>>>,
}

/// Requests cooperative shutdown of every worker from any thread.
///
/// Workers registered after a request start with their flag already
/// cleared, so a request made during launch still reaches them.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    state: Arc<StopState>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every worker's running flag.
    pub fn request_shutdown(&self) {
        if !self.state.requested.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
        let workers = self
            .state
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter() {
            worker.request_stop();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    /// State of every worker registered so far, in registration order.
    pub fn worker_states(&self) -> Vec<Option<WorkerState>> {
        self.workers().iter().map(|w| w.state()).collect()
    }

    pub(crate) fn workers(&self) -> Vec<Arc<WorkerShared>> {
        self.state
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn register(&self, worker: &Arc<WorkerShared>) {
        let mut workers = self
            .state
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        workers.push(Arc::clone(worker));
        // Checked under the lock so a concurrent request cannot miss it.
        if self.is_requested() {
            worker.request_stop();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Pool
// ═══════════════════════════════════════════════════════════════════════

/// What every worker of a launch shares.
#[derive(Clone)]
pub struct LaunchPlan {
    /// Canonical device names, in registration order.
    pub devices: Arc<[String]>,
    pub debugfs_root: PathBuf,
    pub settings: DrainSettings,
    pub sink: Arc<dyn RecordSink>,
}

struct Slot {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<WorkerStatus>>,
}

pub struct WorkerPool {
    target: usize,
    ready: usize,
    shared: Arc<PoolShared>,
    slots: Vec<Slot>,
    shutdown: ShutdownHandle,
}

impl WorkerPool {
    pub fn new(target: usize, shutdown: ShutdownHandle) -> Self {
        Self {
            target,
            ready: 0,
            shared: Arc::new(PoolShared::default()),
            slots: Vec::with_capacity(target),
            shutdown,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn created(&self) -> usize {
        self.shared.created()
    }

    pub fn ready(&self) -> usize {
        self.ready
    }

    pub fn running(&self) -> usize {
        self.shared.running()
    }

    /// Current state of every created worker, by id.
    ///
    /// `None` marks a worker that has not finished opening its channels.
    pub fn states(&self) -> Vec<Option<WorkerState>> {
        self.slots.iter().map(|s| s.shared.state()).collect()
    }

    /// Spawn workers one at a time, waiting for each to report in.
    pub fn launch(&mut self, plan: &LaunchPlan) -> Result<(), TraceError> {
        for cpu in self.slots.len()..self.target {
            let shared = Arc::new(WorkerShared::new(cpu));
            self.shutdown.register(&shared);
            let (ready_tx, ready_rx) = mpsc::sync_channel(1);
            let ctx = WorkerContext {
                shared: Arc::clone(&shared),
                pool: Arc::clone(&self.shared),
                devices: Arc::clone(&plan.devices),
                debugfs_root: plan.debugfs_root.clone(),
                settings: plan.settings,
                sink: Arc::clone(&plan.sink),
                ready: ready_tx,
            };

            let handle = thread::Builder::new()
                .name(format!("dioshark-worker-{cpu}"))
                .spawn(move || worker::run(ctx))
                .map_err(TraceError::Spawn)?;
            self.shared.mark_created();
            self.slots.push(Slot {
                shared,
                handle: Some(handle),
            });

            // A worker that dies before answering drops its sender.
            let state = ready_rx.recv().unwrap_or(WorkerState::Sick);
            if state != WorkerState::Ready {
                error!("Worker {} failed to start", cpu);
                return Err(TraceError::LaunchIncomplete {
                    ready: self.ready,
                    target: self.target,
                });
            }
            self.ready += 1;
        }
        debug!("{} workers ready", self.ready);
        Ok(())
    }

    /// Open the start gate without waiting for acknowledgments.
    pub fn open_gate(&self) {
        self.shared.gate().open();
    }

    /// Open the start gate and wait until every READY worker is running.
    pub fn release(&self, timeout: Duration) -> Result<(), TraceError> {
        self.open_gate();
        self.shared.await_running(self.ready, timeout)?;
        info!("All {} workers running", self.ready);
        Ok(())
    }

    pub fn request_stop(&self) {
        self.shutdown.request_shutdown();
    }

    /// Join every created worker, in id order.
    pub fn join(&mut self) -> Vec<WorkerStatus> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let status = match handle.join() {
                Ok(status) => status,
                Err(_) => {
                    error!("Worker {} panicked", slot.shared.id());
                    slot.shared.set_state(WorkerState::Sick);
                    WorkerStatus {
                        state: WorkerState::Sick,
                        last_error: Some("worker thread panicked".to_string()),
                        ..WorkerStatus::new(slot.shared.id())
                    }
                }
            };
            statuses.push(status);
        }
        statuses
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.slots.iter().any(|s| s.handle.is_some()) {
            warn!("Worker pool dropped with live workers; stopping them");
            self.request_stop();
            self.open_gate();
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::testing::{open_fifo_writer, records, write_channel};
    use std::path::Path;
    use std::time::Instant;

    fn plan(root: &Path, devices: &[&str], sink: Arc<MemorySink>) -> LaunchPlan {
        LaunchPlan {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            debugfs_root: root.to_path_buf(),
            settings: DrainSettings {
                poll_timeout: Duration::from_millis(100),
                empty_read_limit: 20,
            },
            sink,
        }
    }

    #[test]
    fn gate_opens_once() {
        let gate = Arc::new(StartGate::default());
        assert!(!gate.is_open());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait())
        };
        gate.open();
        gate.open();
        waiter.join().unwrap();
        assert!(gate.is_open());
        // Already open: returns at once.
        gate.wait();
    }

    #[test]
    fn await_running_times_out() {
        let shared = PoolShared::default();
        let begin = Instant::now();
        let err = shared
            .await_running(1, Duration::from_millis(50))
            .unwrap_err();
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err,
            TraceError::StartTimeout { running: 0, expected: 1, .. }
        ));
        assert!(shared.await_running(0, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn workers_wait_at_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        for cpu in 0..3 {
            write_channel(dir.path(), "sda", cpu, &records(0, 4, cpu as u32));
        }
        let sink = Arc::new(MemorySink::new());
        let mut pool = WorkerPool::new(3, ShutdownHandle::new());
        pool.launch(&plan(dir.path(), &["sda"], Arc::clone(&sink))).unwrap();

        assert_eq!(pool.created(), 3);
        assert_eq!(pool.ready(), 3);
        assert_eq!(pool.states(), vec![Some(WorkerState::Ready); 3]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.running(), 0);
        assert!(sink.is_empty());

        pool.release(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.running(), 3);

        let statuses = pool.join();
        assert_eq!(statuses.len(), 3);
        for (cpu, status) in statuses.iter().enumerate() {
            assert_eq!(status.id, cpu);
            assert_eq!(status.state, WorkerState::Done);
            assert_eq!(status.records, 4);
        }
        assert_eq!(sink.len(), 12);
    }

    #[test]
    fn sick_worker_ends_launch() {
        let dir = tempfile::tempdir().unwrap();
        write_channel(dir.path(), "sda", 0, &[]);
        // No channel for CPU 1.
        write_channel(dir.path(), "sda", 2, &[]);
        let sink = Arc::new(MemorySink::new());
        let mut pool = WorkerPool::new(3, ShutdownHandle::new());

        let err = pool.launch(&plan(dir.path(), &["sda"], sink)).unwrap_err();
        assert!(matches!(err, TraceError::LaunchIncomplete { ready: 1, target: 3 }));
        assert_eq!(pool.created(), 2);
        assert_eq!(
            pool.states(),
            vec![Some(WorkerState::Ready), Some(WorkerState::Sick)]
        );

        pool.request_stop();
        pool.open_gate();
        let statuses = pool.join();
        assert_eq!(statuses[0].state, WorkerState::Done);
        assert_eq!(statuses[0].records, 0);
        assert_eq!(statuses[1].state, WorkerState::Sick);
        assert!(statuses[1].last_error.as_deref().unwrap().contains("trace1"));
    }

    #[test]
    fn shutdown_reaches_running_workers() {
        let dir = tempfile::tempdir().unwrap();
        let _w0 = open_fifo_writer(dir.path(), "sda", 0);
        let _w1 = open_fifo_writer(dir.path(), "sda", 1);
        let shutdown = ShutdownHandle::new();
        let mut pool = WorkerPool::new(2, shutdown.clone());
        pool.launch(&plan(dir.path(), &["sda"], Arc::new(MemorySink::new())))
            .unwrap();
        pool.release(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.states(), vec![Some(WorkerState::Working); 2]);

        shutdown.request_shutdown();
        assert!(shutdown.is_requested());
        let statuses = pool.join();
        assert!(statuses.iter().all(|s| s.state == WorkerState::Done));
    }

    #[test]
    fn shutdown_before_launch_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let _w0 = open_fifo_writer(dir.path(), "sda", 0);
        let shutdown = ShutdownHandle::new();
        shutdown.request_shutdown();

        let mut pool = WorkerPool::new(1, shutdown);
        pool.launch(&plan(dir.path(), &["sda"], Arc::new(MemorySink::new())))
            .unwrap();
        pool.release(Duration::from_secs(5)).unwrap();
        let statuses = pool.join();
        assert_eq!(statuses[0].state, WorkerState::Done);
    }
}

//! End-to-end trace session.
//!
//! A [`TraceSession`] owns the device registry and, for the length of
//! [`TraceSession::run`], the worker pool.  `run` drives the whole
//! sequence:
//!
//! ```text
//! arm ─▶ launch workers ─▶ start devices ─▶ open gate ─▶ join
//!                                                          │
//!                 report ◀─ close ◀─ teardown ◀─ stop ◀────┘
//! ```
//!
//! Any launch failure short-circuits to the join, and the stop, teardown
//! and close passes run no matter how the launch went.

use crate::config::TraceConfig;
use crate::control::ControlOpener;
use crate::device::{DeviceId, DeviceRegistry, DeviceState, DeviceStatus};
use crate::error::TraceError;
use crate::pool::{LaunchPlan, ShutdownHandle, WorkerPool};
use crate::sink::RecordSink;
use crate::worker::{DrainSettings, WorkerState, WorkerStatus};
use log::{error, info, warn};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Outcome of a [`TraceSession::run`].
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub devices: Vec<DeviceStatus>,
    pub workers: Vec<WorkerStatus>,
    /// The error that aborted the launch, if any.
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<TraceError>,
    /// Stop and teardown failures.
    #[serde(serialize_with = "serialize_errors")]
    pub cleanup_errors: Vec<TraceError>,
    /// Devices closed while still STARTED or STOPPED.
    pub premature_closes: usize,
    pub records: u64,
}

impl RunReport {
    /// No failure, every worker DONE, every device torn down before close.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
            && self.cleanup_errors.is_empty()
            && self.premature_closes == 0
            && self.workers.iter().all(|w| w.state == WorkerState::Done)
            && self
                .devices
                .iter()
                .all(|d| d.closed_from == Some(DeviceState::TornDown))
    }

    /// Log one status line per device and per worker.
    pub fn log_status(&self) {
        for device in &self.devices {
            info!("{}", device);
        }
        for worker in &self.workers {
            info!("{}", worker);
        }
        match &self.failure {
            Some(err) => error!("Trace failed: {}", err),
            None => info!("Collected {} records", self.records),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for device in &self.devices {
            writeln!(f, "{}", device)?;
        }
        for worker in &self.workers {
            writeln!(f, "{}", worker)?;
        }
        match &self.failure {
            Some(err) => write!(f, "failed ({}): {}", err.kind(), err),
            None => write!(f, "{} records", self.records),
        }
    }
}

fn serialize_failure<S: Serializer>(failure: &Option<TraceError>, s: S) -> Result<S::Ok, S::Error> {
    match failure {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

fn serialize_errors<S: Serializer>(errors: &[TraceError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

pub struct TraceSession {
    config: TraceConfig,
    registry: DeviceRegistry,
    sink: Arc<dyn RecordSink>,
    shutdown: ShutdownHandle,
}

impl TraceSession {
    /// Session that controls real block devices.
    pub fn new(config: TraceConfig, sink: Arc<dyn RecordSink>) -> Self {
        let registry = DeviceRegistry::new(config.setup);
        Self::with_registry(config, sink, registry)
    }

    pub fn with_opener(
        config: TraceConfig,
        sink: Arc<dyn RecordSink>,
        opener: Box<dyn ControlOpener>,
    ) -> Self {
        let registry = DeviceRegistry::with_opener(config.setup, opener);
        Self::with_registry(config, sink, registry)
    }

    fn with_registry(config: TraceConfig, sink: Arc<dyn RecordSink>, registry: DeviceRegistry) -> Self {
        Self {
            config,
            registry,
            sink,
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Open `path` and add it to the traced devices.
    pub fn register(&mut self, path: impl AsRef<Path>) -> Result<DeviceId, TraceError> {
        self.registry.register(path)
    }

    /// Trace every registered device until the workers finish.
    ///
    /// Returns once every worker has been joined and every device closed.
    pub fn run(&mut self) -> RunReport {
        let mut pool = None;
        let failure = self.launch(&mut pool).err();
        if let Some(err) = &failure {
            error!("Launch failed: {}", err);
        }

        let workers = match pool.as_mut() {
            Some(pool) => {
                if failure.is_some() {
                    // Flags go down before the gate opens, so released
                    // workers exit without reading.
                    pool.request_stop();
                    pool.open_gate();
                }
                pool.join()
            }
            None => Vec::new(),
        };

        let mut cleanup_errors = self.registry.stop_all();
        cleanup_errors.extend(self.registry.teardown_all());
        let premature_closes = self.registry.close_all();

        let report = RunReport {
            devices: self.registry.report_states(),
            records: workers.iter().map(|w| w.records).sum(),
            workers,
            failure,
            cleanup_errors,
            premature_closes,
        };
        report.log_status();
        report
    }

    fn launch(&mut self, slot: &mut Option<WorkerPool>) -> Result<(), TraceError> {
        if self.registry.is_empty() {
            return Err(TraceError::NoDevices);
        }
        // Devices from an earlier run are closed; only new ones are traced.
        if !self.registry.has_open() {
            return Err(TraceError::NoOpenDevices);
        }
        let target = self.config.worker_count()?;

        self.registry.arm_all()?;

        let plan = LaunchPlan {
            devices: self.registry.channel_names().into(),
            debugfs_root: self.config.debugfs_root.clone(),
            settings: DrainSettings {
                poll_timeout: self.config.poll_timeout,
                empty_read_limit: self.config.empty_read_limit,
            },
            sink: Arc::clone(&self.sink),
        };
        info!(
            "Launching {} workers over {} devices",
            target,
            plan.devices.len()
        );
        let pool = slot.insert(WorkerPool::new(target, self.shutdown.clone()));
        pool.launch(&plan)?;

        self.registry.start_all()?;

        if self.shutdown.is_requested() {
            warn!("Shutdown requested before tracing started");
        }
        pool.release(self.config.start_ack_timeout)
    }
}

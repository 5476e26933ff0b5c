//! Error type shared by the registry, the worker pool and the session.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to arm tracing on {device}: {source}")]
    ArmFailed {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start tracing on {device}: {source}")]
    StartFailed {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stop tracing on {device}: {source}")]
    StopFailed {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to tear down tracing on {device}: {source}")]
    TeardownFailed {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed trace record: {len} bytes")]
    MalformedRecord { len: usize },

    #[error("Bad record magic {magic:#010x} on {channel}")]
    BadMagic { channel: String, magic: u32 },

    #[error("Failed to wait for readable channels: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Failed to read {channel}: {source}")]
    ReadFailed {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("Only {ready} of {target} workers reached READY")]
    LaunchIncomplete { ready: usize, target: usize },

    #[error("Only {running} of {expected} workers acknowledged start within {timeout:?}")]
    StartTimeout {
        running: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Cannot determine the number of online CPUs")]
    CpuCount,

    #[error("No devices registered")]
    NoDevices,

    #[error("No registered device is left to arm")]
    NoOpenDevices,
}

impl TraceError {
    /// Short machine-friendly tag, used in status lines and JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenFailed { .. } => "open_failed",
            Self::ArmFailed { .. } => "arm_failed",
            Self::StartFailed { .. } => "start_failed",
            Self::StopFailed { .. } => "stop_failed",
            Self::TeardownFailed { .. } => "teardown_failed",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::BadMagic { .. } => "bad_magic",
            Self::WaitFailed(_) => "wait_failed",
            Self::ReadFailed { .. } => "read_failed",
            Self::LaunchIncomplete { .. } => "launch_incomplete",
            Self::StartTimeout { .. } => "start_timeout",
            Self::Spawn(_) => "spawn",
            Self::CpuCount => "cpu_count",
            Self::NoDevices => "no_devices",
            Self::NoOpenDevices => "no_open_devices",
        }
    }
}

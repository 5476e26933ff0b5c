//! Trace session configuration.

use crate::error::TraceError;
use dioshark_protocol::{TraceSetup, ACT_MASK_ALL, DEFAULT_BUF_NR, DEFAULT_BUF_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Mount point of debugfs, under which the per-CPU channels live.
pub const DEFAULT_DEBUGFS_ROOT: &str = "/sys/kernel/debug";

/// Default readiness-wait timeout for each drain cycle.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive empty reads after which a worker treats its channels as drained.
pub const DEFAULT_EMPTY_READ_LIMIT: u32 = 100;

/// How long the session waits for every worker to acknowledge the start gate.
pub const DEFAULT_START_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters passed to the ARM control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupParams {
    /// Size of each kernel sub-buffer in bytes.
    pub buf_size: u32,
    /// Number of kernel sub-buffers per CPU.
    pub buf_nr: u32,
    /// Category mask.
    pub act_mask: u16,
    /// First traced sector (0 = whole device).
    pub start_lba: u64,
    /// Last traced sector (0 = whole device).
    pub end_lba: u64,
    /// Only trace this pid (0 = all).
    pub pid: u32,
}

impl Default for SetupParams {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            buf_nr: DEFAULT_BUF_NR,
            act_mask: ACT_MASK_ALL,
            start_lba: 0,
            end_lba: 0,
            pid: 0,
        }
    }
}

impl SetupParams {
    /// Build the setup block handed to the kernel.
    pub fn to_setup(&self) -> TraceSetup {
        TraceSetup {
            act_mask: self.act_mask,
            buf_size: self.buf_size,
            buf_nr: self.buf_nr,
            start_lba: self.start_lba,
            end_lba: self.end_lba,
            pid: self.pid,
            ..TraceSetup::new()
        }
    }
}

/// Configuration for a [`TraceSession`](crate::session::TraceSession).
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Root of debugfs; channels are `<root>/block/<name>/trace<cpu>`.
    pub debugfs_root: PathBuf,
    /// Readiness-wait timeout for each drain cycle.
    pub poll_timeout: Duration,
    /// Consecutive empty reads before a worker considers its channels drained.
    pub empty_read_limit: u32,
    /// Bound on the start-gate acknowledgment wait.
    pub start_ack_timeout: Duration,
    /// Worker count override; `None` uses the number of online CPUs.
    pub cpus: Option<usize>,
    /// ARM parameters.
    pub setup: SetupParams,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            debugfs_root: PathBuf::from(DEFAULT_DEBUGFS_ROOT),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            empty_read_limit: DEFAULT_EMPTY_READ_LIMIT,
            start_ack_timeout: DEFAULT_START_ACK_TIMEOUT,
            cpus: None,
            setup: SetupParams::default(),
        }
    }
}

impl TraceConfig {
    pub fn with_debugfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.debugfs_root = root.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_empty_read_limit(mut self, limit: u32) -> Self {
        self.empty_read_limit = limit;
        self
    }

    pub fn with_start_ack_timeout(mut self, timeout: Duration) -> Self {
        self.start_ack_timeout = timeout;
        self
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_setup(mut self, setup: SetupParams) -> Self {
        self.setup = setup;
        self
    }

    /// Number of workers to launch: the override, or the online CPU count.
    pub fn worker_count(&self) -> Result<usize, TraceError> {
        match self.cpus {
            Some(0) => Err(TraceError::CpuCount),
            Some(n) => Ok(n),
            None => online_cpus(),
        }
    }
}

/// Number of online CPUs, as reported by `sysconf(_SC_NPROCESSORS_ONLN)`.
pub fn online_cpus() -> Result<usize, TraceError> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        return Err(TraceError::CpuCount);
    }
    Ok(n as usize)
}

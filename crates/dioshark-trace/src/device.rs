//! Traced devices and their control state machine.
//!
//! [`DeviceRegistry`] owns every traced [`Device`] in registration order and
//! advances them together, one pass per control operation.  Which devices a
//! pass touches is decided by [`crate::verified::control`]; this module only
//! performs the control calls and records their outcome.
//!
//! Arm and start passes stop at the first failure.  Stop and teardown are
//! best-effort: they run during shutdown and must reach every device.

use crate::config::SetupParams;
use crate::control::{ControlOpener, DeviceControl, IoctlOpener};
use crate::error::TraceError;
use crate::verified::control::{close_is_premature, holds_kernel_state, transition, ControlOp};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Index of a device in its registry.
pub type DeviceId = usize;

/// Control state of a traced device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Open,
    Armed,
    Started,
    Stopped,
    TornDown,
    Closed,
}

impl DeviceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Armed => "ARMED",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::TornDown => "TORN_DOWN",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One traced block device.
pub struct Device {
    id: DeviceId,
    path: PathBuf,
    /// Canonical name returned by ARM.
    name: Option<String>,
    /// Present until the device is closed.
    control: Option<Box<dyn DeviceControl>>,
    state: DeviceState,
    /// State the device was in when its handle was closed.
    closed_from: Option<DeviceState>,
    last_error: Option<String>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical kernel name, once armed.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Name used in log lines: the canonical name if known, else the path.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.path.display().to_string(),
        }
    }

    fn control(&mut self) -> io::Result<&mut (dyn DeviceControl + 'static)> {
        self.control
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "control handle closed"))
    }
}

/// Snapshot of a device for the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub path: PathBuf,
    pub name: Option<String>,
    pub state: DeviceState,
    pub closed_from: Option<DeviceState>,
    pub last_error: Option<String>,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} ({}", self.id, self.path.display())?;
        if let Some(name) = &self.name {
            write!(f, " as {}", name)?;
        }
        write!(f, "): {}", self.state)?;
        if let Some(from) = self.closed_from {
            write!(f, " from {}", from)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ", last error: {}", err)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════════════

/// Ordered set of traced devices.
pub struct DeviceRegistry {
    devices: Vec<Device>,
    setup: SetupParams,
    opener: Box<dyn ControlOpener>,
}

impl DeviceRegistry {
    /// Registry that opens real device nodes.
    pub fn new(setup: SetupParams) -> Self {
        Self::with_opener(setup, Box::new(IoctlOpener))
    }

    pub fn with_opener(setup: SetupParams, opener: Box<dyn ControlOpener>) -> Self {
        Self {
            devices: Vec::new(),
            setup,
            opener,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Open the control handle for `path` and append the device.
    pub fn register(&mut self, path: impl AsRef<Path>) -> Result<DeviceId, TraceError> {
        let path = path.as_ref();
        let control = self
            .opener
            .open(path)
            .map_err(|source| TraceError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let id = self.devices.len();
        self.devices.push(Device {
            id,
            path: path.to_path_buf(),
            name: None,
            control: Some(control),
            state: DeviceState::Open,
            closed_from: None,
            last_error: None,
        });
        debug!("Registered device {} ({})", id, path.display());
        Ok(id)
    }

    /// Canonical names of every ARMED or STARTED device, in registration
    /// order.
    ///
    /// This is the read-only snapshot handed to the workers.
    pub fn channel_names(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| matches!(d.state, DeviceState::Armed | DeviceState::Started))
            .filter_map(|d| d.name.clone())
            .collect()
    }

    /// Whether any device is still waiting to be armed.
    pub fn has_open(&self) -> bool {
        self.devices.iter().any(|d| d.state == DeviceState::Open)
    }

    /// ARM every OPEN device.
    ///
    /// Stops at the first failure.  Devices armed earlier in the pass stay
    /// ARMED; they are released by the usual stop/teardown cleanup.
    pub fn arm_all(&mut self) -> Result<(), TraceError> {
        let setup = self.setup.to_setup();
        for device in &mut self.devices {
            let Some(next) = transition(device.state, ControlOp::Arm) else {
                continue;
            };
            match device.control().and_then(|c| c.arm(&setup)) {
                Ok(name) => {
                    info!("Armed {} as {}", device.path.display(), name);
                    device.name = Some(name);
                    device.state = next;
                }
                Err(source) => {
                    device.last_error = Some(source.to_string());
                    return Err(TraceError::ArmFailed {
                        device: device.path.display().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// START every ARMED device.  Stops at the first failure.
    pub fn start_all(&mut self) -> Result<(), TraceError> {
        for device in &mut self.devices {
            let Some(next) = transition(device.state, ControlOp::Start) else {
                continue;
            };
            match device.control().and_then(|c| c.start()) {
                Ok(()) => {
                    info!("Started tracing on {}", device.label());
                    device.state = next;
                }
                Err(source) => {
                    device.last_error = Some(source.to_string());
                    return Err(TraceError::StartFailed {
                        device: device.label(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// STOP every device that still holds kernel trace state.
    ///
    /// Best-effort: a failure is logged and recorded, and the device still
    /// moves to STOPPED so that teardown is attempted.  Returns the failures.
    pub fn stop_all(&mut self) -> Vec<TraceError> {
        let mut failures = Vec::new();
        for device in &mut self.devices {
            let Some(next) = transition(device.state, ControlOp::Stop) else {
                continue;
            };
            match device.control().and_then(|c| c.stop()) {
                Ok(()) => info!("Stopped tracing on {}", device.label()),
                Err(source) => {
                    let err = TraceError::StopFailed {
                        device: device.label(),
                        source,
                    };
                    warn!("{}", err);
                    device.last_error = Some(err.to_string());
                    failures.push(err);
                }
            }
            device.state = next;
        }
        failures
    }

    /// TEARDOWN every STOPPED device.
    ///
    /// Best-effort.  A device whose teardown fails stays STOPPED, so closing
    /// it is reported as premature.
    pub fn teardown_all(&mut self) -> Vec<TraceError> {
        let mut failures = Vec::new();
        for device in &mut self.devices {
            let Some(next) = transition(device.state, ControlOp::Teardown) else {
                continue;
            };
            match device.control().and_then(|c| c.teardown()) {
                Ok(()) => {
                    info!("Tore down tracing on {}", device.label());
                    device.state = next;
                }
                Err(source) => {
                    let err = TraceError::TeardownFailed {
                        device: device.label(),
                        source,
                    };
                    warn!("{}", err);
                    device.last_error = Some(err.to_string());
                    failures.push(err);
                }
            }
        }
        failures
    }

    /// Close every device's control handle.
    ///
    /// Devices still STARTED or STOPPED are reported: stop and teardown
    /// should have run first.  Returns how many were closed prematurely.
    pub fn close_all(&mut self) -> usize {
        let mut premature = 0;
        for device in &mut self.devices {
            let Some(next) = transition(device.state, ControlOp::Close) else {
                continue;
            };
            if close_is_premature(device.state) {
                warn!(
                    "Closing {} while still {}",
                    device.label(),
                    device.state
                );
                premature += 1;
            } else {
                debug!("Closing {} ({})", device.label(), device.state);
            }
            device.control = None;
            device.closed_from = Some(device.state);
            device.state = next;
        }
        premature
    }

    /// Per-device status, in registration order.
    pub fn report_states(&self) -> Vec<DeviceStatus> {
        self.devices
            .iter()
            .map(|d| DeviceStatus {
                id: d.id,
                path: d.path.clone(),
                name: d.name.clone(),
                state: d.state,
                closed_from: d.closed_from,
                last_error: d.last_error.clone(),
            })
            .collect()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for device in &self.devices {
            if holds_kernel_state(device.state) {
                warn!(
                    "Dropping {} while {}; kernel trace buffers were not released",
                    device.label(),
                    device.state
                );
            }
        }
    }
}

//! Device-control transport.
//!
//! [`DeviceControl`] is the seam between the registry's state machine and
//! the kernel.  [`IoctlControl`] issues the block trace ioctls on the device
//! node; tests substitute a scripted implementation.

use dioshark_protocol::{TraceSetup, TRACE_SETUP, TRACE_START, TRACE_STOP, TRACE_TEARDOWN};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// The four control calls of the block trace protocol.
pub trait DeviceControl {
    /// Allocate kernel-side buffers.  Returns the canonical device name.
    fn arm(&mut self, setup: &TraceSetup) -> io::Result<String>;

    /// Begin emitting records.
    fn start(&mut self) -> io::Result<()>;

    /// Stop emitting records.
    fn stop(&mut self) -> io::Result<()>;

    /// Release kernel-side buffers.
    fn teardown(&mut self) -> io::Result<()>;
}

/// Opens a control handle for a device path.
pub trait ControlOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceControl>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  ioctl transport
// ═══════════════════════════════════════════════════════════════════════

/// Control handle backed by the block device node.
///
/// The node is opened read-only and non-blocking; closing happens on drop.
#[derive(Debug)]
pub struct IoctlControl {
    file: File,
    node: PathBuf,
}

impl IoctlControl {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            file,
            node: path.to_path_buf(),
        })
    }

    fn ioctl_none(&self, request: u32) -> io::Result<()> {
        // SAFETY: the request takes no argument and the fd is owned by self.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DeviceControl for IoctlControl {
    fn arm(&mut self, setup: &TraceSetup) -> io::Result<String> {
        let mut setup = *setup;
        // SAFETY: TRACE_SETUP reads and writes exactly one TraceSetup, whose
        // layout matches the kernel's (size checked at compile time).
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                TRACE_SETUP as _,
                &mut setup as *mut TraceSetup,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // Kernel buffers exist from here on; the arm must succeed.
        Ok(canonical_name(&setup, &self.node))
    }

    fn start(&mut self) -> io::Result<()> {
        self.ioctl_none(TRACE_START)
    }

    fn stop(&mut self) -> io::Result<()> {
        self.ioctl_none(TRACE_STOP)
    }

    fn teardown(&mut self) -> io::Result<()> {
        self.ioctl_none(TRACE_TEARDOWN)
    }
}

/// Name the kernel wrote back into `setup`.
///
/// Invalid UTF-8 is replaced.  An empty name falls back to the file name
/// of the device node.
fn canonical_name(setup: &TraceSetup, node: &Path) -> String {
    if let Some(name) = setup.name() {
        return name.to_owned();
    }
    let end = setup
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(setup.name.len());
    if end > 0 {
        let name = String::from_utf8_lossy(&setup.name[..end]).into_owned();
        warn!("Kernel returned a non-UTF-8 name for {}: {}", node.display(), name);
        return name;
    }
    let fallback = node
        .file_name()
        .map_or_else(|| node.display().to_string(), |n| n.to_string_lossy().into_owned());
    warn!(
        "Kernel returned no name for {}; using {}",
        node.display(),
        fallback
    );
    fallback
}

/// Opens [`IoctlControl`] handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlOpener;

impl ControlOpener for IoctlOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceControl>> {
        Ok(Box::new(IoctlControl::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_device_fails() {
        let err = IoctlOpener
            .open(Path::new("/nonexistent/dioshark-device"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn canonical_name_from_setup() {
        let mut setup = TraceSetup::new();
        setup.set_name("nvme0n1");
        assert_eq!(canonical_name(&setup, Path::new("/dev/nvme0n1")), "nvme0n1");
    }

    #[test]
    fn invalid_name_is_kept_lossily() {
        let mut setup = TraceSetup::new();
        setup.name[..4].copy_from_slice(&[b's', b'd', 0xff, b'a']);
        assert_eq!(canonical_name(&setup, Path::new("/dev/sda")), "sd\u{fffd}a");
    }

    #[test]
    fn empty_name_falls_back_to_node() {
        let setup = TraceSetup::new();
        assert_eq!(canonical_name(&setup, Path::new("/dev/sdc")), "sdc");
    }

    #[test]
    fn ioctls_on_a_regular_file_fail() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut control = IoctlControl::open(file.path()).unwrap();
        // Regular files reject block ioctls with ENOTTY.
        assert!(control.arm(&TraceSetup::new()).is_err());
        assert!(control.start().is_err());
        assert!(control.stop().is_err());
        assert!(control.teardown().is_err());
    }
}

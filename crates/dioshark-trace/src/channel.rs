//! Per-CPU trace channels and the multi-channel readiness wait.
//!
//! Each worker owns a [`ChannelSet`] with one [`Channel`] per traced
//! device, all for the worker's CPU.  The set waits on every channel at
//! once with `poll(2)`, bounded by the configured timeout so the worker can
//! re-check its running flag even when no data arrives.

use crate::error::TraceError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `<root>/block/<device>/trace<cpu>`
pub fn channel_path(root: &Path, device: &str, cpu: usize) -> PathBuf {
    root.join("block").join(device).join(format!("trace{cpu}"))
}

/// One readable per-device, per-CPU record stream.
#[derive(Debug)]
pub struct Channel {
    file: File,
    device: String,
    cpu: usize,
}

impl Channel {
    /// Open the channel read-only and non-blocking.
    pub fn open(root: &Path, device: &str, cpu: usize) -> Result<Self, TraceError> {
        let path = channel_path(root, device, cpu);
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| TraceError::OpenFailed { path, source })?;
        Ok(Self {
            file,
            device: device.to_owned(),
            cpu,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// `<device>/trace<cpu>`, for log lines.
    pub fn label(&self) -> String {
        format!("{}/trace{}", self.device, self.cpu)
    }

    /// One `read(2)` into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    /// Read and discard up to `len` bytes of record payload.
    ///
    /// Stops early when the channel has nothing more to give right now.
    /// Returns how many bytes were consumed.
    pub fn skip(&mut self, len: usize) -> io::Result<usize> {
        let mut scratch = [0u8; 256];
        let mut skipped = 0;
        while skipped < len {
            let want = (len - skipped).min(scratch.len());
            match self.file.read(&mut scratch[..want]) {
                Ok(0) => break,
                Ok(n) => skipped += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }
}

/// The channels drained by one worker.
#[derive(Debug)]
pub struct ChannelSet {
    channels: Vec<Channel>,
    pollfds: Vec<libc::pollfd>,
}

impl ChannelSet {
    /// Open one channel per device for `cpu`.
    ///
    /// Fails on the first channel that cannot be opened; channels opened
    /// before it are closed when the partial set is dropped.
    pub fn open(root: &Path, devices: &[String], cpu: usize) -> Result<Self, TraceError> {
        let mut channels = Vec::with_capacity(devices.len());
        for device in devices {
            channels.push(Channel::open(root, device, cpu)?);
        }
        Ok(Self::from_channels(channels))
    }

    pub fn from_channels(channels: Vec<Channel>) -> Self {
        let pollfds = channels
            .iter()
            .map(|c| libc::pollfd {
                fd: c.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        Self { channels, pollfds }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Wait until at least one channel is readable or `timeout` elapses.
    ///
    /// Returns the indices of readable channels; an empty vector means the
    /// wait timed out or was interrupted by a signal.  Hang-up and error
    /// conditions count as readable so the following read reports them.
    pub fn wait_readable(&mut self, timeout: Duration) -> io::Result<Vec<usize>> {
        for pfd in &mut self.pollfds {
            pfd.revents = 0;
        }
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: pollfds is a valid, exclusively borrowed array of
        // `len` pollfd structs whose fds are owned by `channels`.
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut readable = Vec::with_capacity(n as usize);
        for (index, pfd) in self.pollfds.iter().enumerate() {
            if pfd.revents & libc::POLLNVAL != 0 {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                readable.push(index);
            }
        }
        Ok(readable)
    }

    /// Read from channel `index` into `buf`.
    pub fn read(&mut self, index: usize, buf: &mut [u8]) -> io::Result<usize> {
        self.channel_mut(index)?.read(buf)
    }

    /// Discard up to `len` payload bytes from channel `index`.
    pub fn skip(&mut self, index: usize, len: usize) -> io::Result<usize> {
        self.channel_mut(index)?.skip(len)
    }

    fn channel_mut(&mut self, index: usize) -> io::Result<&mut Channel> {
        self.channels.get_mut(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no channel {index}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample;
    use crate::testing::{open_fifo_writer, write_channel};
    use dioshark_protocol::RECORD_SIZE;
    use std::time::Instant;

    #[test]
    fn path_layout() {
        assert_eq!(
            channel_path(Path::new("/sys/kernel/debug"), "sda", 3),
            PathBuf::from("/sys/kernel/debug/block/sda/trace3")
        );
    }

    #[test]
    fn open_missing_channel() {
        let dir = tempfile::tempdir().unwrap();
        let err = Channel::open(dir.path(), "sda", 0).unwrap_err();
        assert!(matches!(err, TraceError::OpenFailed { ref path, .. } if path.ends_with("block/sda/trace0")));
    }

    #[test]
    fn partial_set_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_channel(dir.path(), "sda", 0, &[]);
        let devices = vec!["sda".to_string(), "sdb".to_string()];
        let err = ChannelSet::open(dir.path(), &devices, 0).unwrap_err();
        assert!(matches!(err, TraceError::OpenFailed { .. }));
    }

    #[test]
    fn regular_files_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        write_channel(dir.path(), "sda", 1, &[sample(0)]);
        write_channel(dir.path(), "sdb", 1, &[]);
        let devices = vec!["sda".to_string(), "sdb".to_string()];
        let mut set = ChannelSet::open(dir.path(), &devices, 1).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1).unwrap().label(), "sdb/trace1");

        let readable = set.wait_readable(Duration::from_millis(100)).unwrap();
        assert_eq!(readable, vec![0, 1]);

        let mut buf = [0u8; RECORD_SIZE];
        assert_eq!(set.read(0, &mut buf).unwrap(), RECORD_SIZE);
        assert_eq!(set.read(0, &mut buf).unwrap(), 0);
        assert_eq!(set.read(1, &mut buf).unwrap(), 0);
        assert!(set.read(2, &mut buf).is_err());
    }

    #[test]
    fn idle_fifo_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let _writer = open_fifo_writer(dir.path(), "sda", 0);
        let mut set = ChannelSet::open(dir.path(), &["sda".to_string()], 0).unwrap();

        let begin = Instant::now();
        let readable = set.wait_readable(Duration::from_millis(50)).unwrap();
        assert!(readable.is_empty());
        assert!(begin.elapsed() >= Duration::from_millis(40));

        let mut buf = [0u8; RECORD_SIZE];
        let err = set.read(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}

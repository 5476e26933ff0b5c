//! Test fixtures: a scripted control transport and on-disk channels.

use crate::channel::channel_path;
use crate::control::{ControlOpener, DeviceControl};
use crate::record::TraceRecord;
use dioshark_protocol::TraceSetup;
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A control call recorded by [`ScriptedOpener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ControlCall {
    Arm,
    Start,
    Stop,
    Teardown,
    /// The handle was dropped.
    Close,
}

type StartHook = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Default)]
struct Script {
    fail_open: HashSet<PathBuf>,
    failures: HashSet<(PathBuf, ControlCall)>,
    calls: Vec<(PathBuf, ControlCall)>,
    on_start: Option<StartHook>,
}

/// Opener whose handles record every call and fail where told to.
///
/// ARM succeeds with the file name of the device path, so `/dev/sda` arms
/// as `sda`.
#[derive(Clone, Default)]
pub(crate) struct ScriptedOpener {
    script: Arc<Mutex<Script>>,
}

impl ScriptedOpener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_open(self, path: impl Into<PathBuf>) -> Self {
        self.script.lock().unwrap().fail_open.insert(path.into());
        self
    }

    pub(crate) fn fail_on(self, path: impl Into<PathBuf>, call: ControlCall) -> Self {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert((path.into(), call));
        self
    }

    /// Run `hook` inside every successful START, after it is recorded.
    pub(crate) fn on_start(&self, hook: impl Fn(&Path) + Send + Sync + 'static) {
        self.script.lock().unwrap().on_start = Some(Arc::new(hook));
    }

    /// Every call, in the order it was made across all devices.
    pub(crate) fn calls(&self) -> Vec<(PathBuf, ControlCall)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub(crate) fn calls_for(&self, path: impl AsRef<Path>) -> Vec<ControlCall> {
        let path = path.as_ref();
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, call)| call)
            .collect()
    }
}

impl ControlOpener for ScriptedOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceControl>> {
        if self.script.lock().unwrap().fail_open.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok(Box::new(ScriptedControl {
            path: path.to_path_buf(),
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedControl {
    path: PathBuf,
    script: Arc<Mutex<Script>>,
}

impl ScriptedControl {
    fn call(&self, call: ControlCall) -> io::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.calls.push((self.path.clone(), call));
        if script.failures.contains(&(self.path.clone(), call)) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }
}

impl DeviceControl for ScriptedControl {
    fn arm(&mut self, _setup: &TraceSetup) -> io::Result<String> {
        self.call(ControlCall::Arm)?;
        Ok(self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    fn start(&mut self) -> io::Result<()> {
        self.call(ControlCall::Start)?;
        let hook = self.script.lock().unwrap().on_start.clone();
        if let Some(hook) = hook {
            hook(&self.path);
        }
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.call(ControlCall::Stop)
    }

    fn teardown(&mut self) -> io::Result<()> {
        self.call(ControlCall::Teardown)
    }
}

impl Drop for ScriptedControl {
    fn drop(&mut self) {
        if let Ok(mut script) = self.script.lock() {
            script.calls.push((self.path.clone(), ControlCall::Close));
        }
    }
}

// ─── Channel fixtures ───────────────────────────────────────────────

/// Records `first..first + count` as emitted by `cpu`.
pub(crate) fn records(first: u32, count: u32, cpu: u32) -> Vec<TraceRecord> {
    (first..first + count)
        .map(|seq| TraceRecord {
            cpu,
            ..crate::record::sample(seq)
        })
        .collect()
}

/// Create `<root>/block/<device>/trace<cpu>` holding `records`.
///
/// A regular file yields its records and then reads 0 bytes forever.
pub(crate) fn write_channel(root: &Path, device: &str, cpu: usize, records: &[TraceRecord]) {
    let path = channel_path(root, device, cpu);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = File::create(&path).unwrap();
    for record in records {
        file.write_all(&record.encode()).unwrap();
    }
}

/// Create the channel as a FIFO and return a handle that keeps it open.
///
/// While the handle lives, readers see no data and no hang-up, so polls
/// run to their timeout.
pub(crate) fn open_fifo_writer(root: &Path, device: &str, cpu: usize) -> File {
    let path = channel_path(root, device, cpu);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: c_path is a valid NUL-terminated string.
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    assert_eq!(ret, 0, "mkfifo {}: {}", path.display(), io::Error::last_os_error());
    // O_RDWR opens a FIFO without waiting for a reader.
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .unwrap()
}

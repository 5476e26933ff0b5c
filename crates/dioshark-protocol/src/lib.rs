//! Wire contract between dio-shark and the kernel block tracing facility.
//!
//! This crate defines the control-call opcodes, the setup block passed to
//! the ARM call, and the fixed 48-byte trace record read from each per-CPU
//! channel.  It is `no_std`-compatible with zero dependencies.
//!
//! # Transport
//!
//! Control goes through `ioctl(2)` on the traced block device node, opened
//! read-only:
//!
//! 1. ARM (`_IOWR(0x12, 115, TraceSetup)`) allocates kernel-side buffers and
//!    writes the canonical device name back into [`TraceSetup::name`]
//! 2. START (`_IO(0x12, 116)`) begins emitting records
//! 3. STOP (`_IO(0x12, 117)`) stops emitting records
//! 4. TEARDOWN (`_IO(0x12, 118)`) releases the kernel-side buffers
//!
//! Records are read verbatim from `<debugfs>/block/<name>/trace<cpu>`.
//! The channel is host-native; no byte swapping happens on either side.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Control opcodes
// ═══════════════════════════════════════════════════════════════════════

/// ioctl "type" byte shared by all block trace control calls.
pub const IOCTL_TYPE: u32 = 0x12;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Build an ioctl request number (generic Linux encoding).
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
    (dir << IOC_DIRSHIFT) | (size << IOC_SIZESHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

/// `_IO(ty, nr)`: no argument.
pub const fn io(ty: u32, nr: u32) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

/// `_IOWR(ty, nr, T)`: argument read and written by the kernel.
pub const fn iowr(ty: u32, nr: u32, size: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// ARM: configure and allocate kernel-side trace buffers.
pub const TRACE_SETUP: u32 = iowr(IOCTL_TYPE, 115, TRACE_SETUP_SIZE as u32);

/// START: begin emitting records.
pub const TRACE_START: u32 = io(IOCTL_TYPE, 116);

/// STOP: cease emitting records.
pub const TRACE_STOP: u32 = io(IOCTL_TYPE, 117);

/// TEARDOWN: release kernel-side trace buffers.
pub const TRACE_TEARDOWN: u32 = io(IOCTL_TYPE, 118);

// ═══════════════════════════════════════════════════════════════════════
//  Setup block
// ═══════════════════════════════════════════════════════════════════════

/// Length of the canonical name buffer filled in by ARM.
pub const DEVICE_NAME_LEN: usize = 32;

/// Size of [`TraceSetup`] as seen by the kernel.
pub const TRACE_SETUP_SIZE: usize = 72;

/// Default per-CPU sub-buffer size (512 KiB).
pub const DEFAULT_BUF_SIZE: u32 = 512 * 1024;

/// Default number of sub-buffers per CPU.
pub const DEFAULT_BUF_NR: u32 = 4;

/// Action mask with every category enabled.
pub const ACT_MASK_ALL: u16 = !0;

/// Fixed-layout argument of the ARM call.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    32    name        ← written by kernel
/// 0x20    2     act_mask
/// 0x22    2     (padding)
/// 0x24    4     buf_size
/// 0x28    4     buf_nr
/// 0x2C    4     (padding)
/// 0x30    8     start_lba
/// 0x38    8     end_lba
/// 0x40    4     pid
/// 0x44    4     (padding)
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceSetup {
    /// Canonical device name, NUL terminated.
    pub name: [u8; DEVICE_NAME_LEN],
    /// Category mask; `ACT_MASK_ALL` traces everything.
    pub act_mask: u16,
    /// Size of each sub-buffer in bytes.
    pub buf_size: u32,
    /// Number of sub-buffers.
    pub buf_nr: u32,
    /// First sector of the traced range (0 = whole device).
    pub start_lba: u64,
    /// Last sector of the traced range (0 = whole device).
    pub end_lba: u64,
    /// Only trace I/O issued by this pid (0 = every pid).
    pub pid: u32,
}

const _: () = assert!(core::mem::size_of::<TraceSetup>() == TRACE_SETUP_SIZE);

impl TraceSetup {
    /// Setup block with the default buffer geometry and every action enabled.
    pub const fn new() -> Self {
        Self {
            name: [0; DEVICE_NAME_LEN],
            act_mask: ACT_MASK_ALL,
            buf_size: DEFAULT_BUF_SIZE,
            buf_nr: DEFAULT_BUF_NR,
            start_lba: 0,
            end_lba: 0,
            pid: 0,
        }
    }

    /// The canonical name written back by the kernel, up to the first NUL.
    ///
    /// Returns `None` if the name is empty or not valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DEVICE_NAME_LEN);
        if end == 0 {
            return None;
        }
        core::str::from_utf8(&self.name[..end]).ok()
    }

    /// Store `name` into the name buffer, truncating so a NUL always fits.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; DEVICE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(DEVICE_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }
}

impl Default for TraceSetup {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Trace record
// ═══════════════════════════════════════════════════════════════════════

/// Size of one record on the wire.
pub const RECORD_SIZE: usize = 48;

/// Magic in the upper 24 bits of [`RawRecord::magic`].
pub const RECORD_MAGIC: u32 = 0x6561_7400;

/// Record format version in the low byte of [`RawRecord::magic`].
pub const RECORD_VERSION: u8 = 0x07;

/// Shift of the category bits inside the action code.
pub const CATEGORY_SHIFT: u32 = 16;

// Action codes (low 16 bits of `action`).
pub const ACTION_QUEUE: u16 = 1;
pub const ACTION_BACKMERGE: u16 = 2;
pub const ACTION_FRONTMERGE: u16 = 3;
pub const ACTION_GETRQ: u16 = 4;
pub const ACTION_SLEEPRQ: u16 = 5;
pub const ACTION_REQUEUE: u16 = 6;
pub const ACTION_ISSUE: u16 = 7;
pub const ACTION_COMPLETE: u16 = 8;
pub const ACTION_PLUG: u16 = 9;
pub const ACTION_UNPLUG_IO: u16 = 10;
pub const ACTION_UNPLUG_TIMER: u16 = 11;
pub const ACTION_INSERT: u16 = 12;
pub const ACTION_SPLIT: u16 = 13;
pub const ACTION_BOUNCE: u16 = 14;
pub const ACTION_REMAP: u16 = 15;
pub const ACTION_ABORT: u16 = 16;
pub const ACTION_DRV_DATA: u16 = 17;

// Category bits (upper 16 bits of `action`, already shifted down).
pub const CATEGORY_READ: u16 = 1 << 0;
pub const CATEGORY_WRITE: u16 = 1 << 1;
pub const CATEGORY_FLUSH: u16 = 1 << 2;
pub const CATEGORY_SYNC: u16 = 1 << 3;
pub const CATEGORY_DISCARD: u16 = 1 << 13;
pub const CATEGORY_FUA: u16 = 1 << 15;

/// One trace record exactly as emitted by the kernel.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     magic
/// 0x04    4     sequence
/// 0x08    8     time
/// 0x10    8     sector
/// 0x18    4     bytes
/// 0x1C    4     action
/// 0x20    4     pid
/// 0x24    4     device
/// 0x28    4     cpu
/// 0x2C    2     error
/// 0x2E    2     pdu_len
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub magic: u32,
    pub sequence: u32,
    pub time: u64,
    pub sector: u64,
    pub bytes: u32,
    pub action: u32,
    pub pid: u32,
    pub device: u32,
    pub cpu: u32,
    pub error: u16,
    pub pdu_len: u16,
}

const _: () = assert!(core::mem::size_of::<RawRecord>() == RECORD_SIZE);

/// The buffer handed to [`decode_record`] was shorter than a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShortRecord {
    /// Bytes actually available.
    pub len: usize,
}

impl core::fmt::Display for ShortRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "record needs {} bytes, got {}", RECORD_SIZE, self.len)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ShortRecord {}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(b)
}

/// Decode the first [`RECORD_SIZE`] bytes of `buf`.
///
/// Trailing bytes are ignored.  Fails only when `buf` is too short.
pub fn decode_record(buf: &[u8]) -> Result<RawRecord, ShortRecord> {
    if buf.len() < RECORD_SIZE {
        return Err(ShortRecord { len: buf.len() });
    }
    Ok(RawRecord {
        magic: u32_at(buf, 0x00),
        sequence: u32_at(buf, 0x04),
        time: u64_at(buf, 0x08),
        sector: u64_at(buf, 0x10),
        bytes: u32_at(buf, 0x18),
        action: u32_at(buf, 0x1C),
        pid: u32_at(buf, 0x20),
        device: u32_at(buf, 0x24),
        cpu: u32_at(buf, 0x28),
        error: u16_at(buf, 0x2C),
        pdu_len: u16_at(buf, 0x2E),
    })
}

/// Encode `record` into its 48-byte wire form.
pub fn encode_record(record: &RawRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0x00..0x04].copy_from_slice(&record.magic.to_ne_bytes());
    buf[0x04..0x08].copy_from_slice(&record.sequence.to_ne_bytes());
    buf[0x08..0x10].copy_from_slice(&record.time.to_ne_bytes());
    buf[0x10..0x18].copy_from_slice(&record.sector.to_ne_bytes());
    buf[0x18..0x1C].copy_from_slice(&record.bytes.to_ne_bytes());
    buf[0x1C..0x20].copy_from_slice(&record.action.to_ne_bytes());
    buf[0x20..0x24].copy_from_slice(&record.pid.to_ne_bytes());
    buf[0x24..0x28].copy_from_slice(&record.device.to_ne_bytes());
    buf[0x28..0x2C].copy_from_slice(&record.cpu.to_ne_bytes());
    buf[0x2C..0x2E].copy_from_slice(&record.error.to_ne_bytes());
    buf[0x2E..0x30].copy_from_slice(&record.pdu_len.to_ne_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_request_matches_kernel_value() {
        // BLKTRACESETUP on x86_64 / aarch64.
        assert_eq!(TRACE_SETUP, 0xC048_1273);
        assert_eq!(TRACE_START, 0x1274);
        assert_eq!(TRACE_STOP, 0x1275);
        assert_eq!(TRACE_TEARDOWN, 0x1276);
    }

    #[test]
    fn setup_field_offsets() {
        let setup = TraceSetup::new();
        let base = &setup as *const TraceSetup as usize;
        assert_eq!(&setup.act_mask as *const u16 as usize - base, 0x20);
        assert_eq!(&setup.buf_size as *const u32 as usize - base, 0x24);
        assert_eq!(&setup.start_lba as *const u64 as usize - base, 0x30);
        assert_eq!(&setup.pid as *const u32 as usize - base, 0x40);
    }

    #[test]
    fn default_setup_traces_everything() {
        let setup = TraceSetup::default();
        assert_eq!(setup.act_mask, 0xffff);
        assert_eq!(setup.buf_size, 512 * 1024);
        assert_eq!(setup.buf_nr, 4);
        assert!(setup.name().is_none());
    }

    #[test]
    fn name_stops_at_nul() {
        let mut setup = TraceSetup::new();
        setup.set_name("sda");
        assert_eq!(setup.name(), Some("sda"));
    }

    #[test]
    fn set_name_truncates_and_keeps_terminator() {
        let mut setup = TraceSetup::new();
        let long = [b'x'; 64];
        setup.set_name(core::str::from_utf8(&long).unwrap());
        assert_eq!(setup.name().map(str::len), Some(DEVICE_NAME_LEN - 1));
        assert_eq!(setup.name[DEVICE_NAME_LEN - 1], 0);
    }

    #[test]
    fn record_roundtrip() {
        let record = RawRecord {
            magic: RECORD_MAGIC | RECORD_VERSION as u32,
            sequence: 7,
            time: 123_456_789,
            sector: 2048,
            bytes: 4096,
            action: ((CATEGORY_WRITE as u32) << CATEGORY_SHIFT) | ACTION_QUEUE as u32,
            pid: 4242,
            device: (8 << 20) | 1,
            cpu: 3,
            error: 0,
            pdu_len: 12,
        };
        let wire = encode_record(&record);
        assert_eq!(decode_record(&wire), Ok(record));
    }

    #[test]
    fn decode_short_buffer() {
        let wire = [0u8; RECORD_SIZE - 1];
        assert_eq!(
            decode_record(&wire),
            Err(ShortRecord {
                len: RECORD_SIZE - 1
            })
        );
        assert_eq!(decode_record(&[]), Err(ShortRecord { len: 0 }));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut wire = [0xAAu8; RECORD_SIZE + 8];
        wire[..RECORD_SIZE].copy_from_slice(&encode_record(&RawRecord::default()));
        assert_eq!(decode_record(&wire), Ok(RawRecord::default()));
    }
}

//! Decoded trace records.
//!
//! [`TraceRecord`] is the host-side view of the 48-byte record the kernel
//! writes into each per-CPU channel.  Decoding is pure; the wire layout
//! lives in [`dioshark_protocol`].

use crate::error::TraceError;
use dioshark_protocol::{
    decode_record, encode_record, RawRecord, CATEGORY_SHIFT, RECORD_MAGIC, RECORD_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Trace record
// ═══════════════════════════════════════════════════════════════════════

/// One decoded trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Magic and format version.
    pub magic: u32,
    /// Per-channel sequence number.
    pub sequence: u32,
    /// Kernel timestamp in nanoseconds.
    pub time: u64,
    /// Starting sector of the I/O.
    pub sector: u64,
    /// Length of the I/O in bytes.
    pub bytes: u32,
    /// Action code (low 16 bits) and category mask (high 16 bits).
    pub action: u32,
    /// Process that issued the I/O.
    pub pid: u32,
    /// Device number (major << 20 | minor).
    pub device: u32,
    /// CPU that emitted the record.
    pub cpu: u32,
    /// Completion error code.
    pub error: u16,
    /// Length of the auxiliary payload that follows in the stream.
    pub pdu_len: u16,
}

impl TraceRecord {
    /// Decode a record from the front of `buf`.
    ///
    /// Fails with [`TraceError::MalformedRecord`] if `buf` holds fewer than
    /// [`RECORD_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, TraceError> {
        decode_record(buf)
            .map(Self::from_raw)
            .map_err(|short| TraceError::MalformedRecord { len: short.len })
    }

    /// Encode into the 48-byte wire form.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        encode_record(&self.to_raw())
    }

    pub fn from_raw(raw: RawRecord) -> Self {
        Self {
            magic: raw.magic,
            sequence: raw.sequence,
            time: raw.time,
            sector: raw.sector,
            bytes: raw.bytes,
            action: raw.action,
            pid: raw.pid,
            device: raw.device,
            cpu: raw.cpu,
            error: raw.error,
            pdu_len: raw.pdu_len,
        }
    }

    pub fn to_raw(&self) -> RawRecord {
        RawRecord {
            magic: self.magic,
            sequence: self.sequence,
            time: self.time,
            sector: self.sector,
            bytes: self.bytes,
            action: self.action,
            pid: self.pid,
            device: self.device,
            cpu: self.cpu,
            error: self.error,
            pdu_len: self.pdu_len,
        }
    }

    /// Whether the upper 24 bits carry the kernel's trace magic.
    pub fn has_valid_magic(&self) -> bool {
        self.magic & 0xffff_ff00 == RECORD_MAGIC
    }

    /// Record format version (low byte of the magic).
    pub fn version(&self) -> u8 {
        (self.magic & 0xff) as u8
    }

    /// Action code without the category bits.
    pub fn action_code(&self) -> u16 {
        (self.action & 0xffff) as u16
    }

    /// Category mask (read, write, sync, ...).
    pub fn category(&self) -> u16 {
        (self.action >> CATEGORY_SHIFT) as u16
    }

    /// Device major number.
    pub fn major(&self) -> u32 {
        self.device >> 20
    }

    /// Device minor number.
    pub fn minor(&self) -> u32 {
        self.device & ((1 << 20) - 1)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Display
// ═══════════════════════════════════════════════════════════════════════

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.time / 1_000_000_000;
        let nanos = self.time % 1_000_000_000;
        write!(
            f,
            "{:>3},{:<3} {:>2} {:>8} {:>5}.{:09} {:>6} {:>2} {:<3} {} + {}",
            self.major(),
            self.minor(),
            self.cpu,
            self.sequence,
            secs,
            nanos,
            self.pid,
            crate::verified::record::action_name(self.action_code()),
            crate::verified::record::rwbs(self.category()),
            self.sector,
            self.bytes >> 9,
        )?;
        if self.error != 0 {
            write!(f, " [{}]", self.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample(sequence: u32) -> TraceRecord {
    use dioshark_protocol::{ACTION_QUEUE, CATEGORY_WRITE, RECORD_VERSION};
    TraceRecord {
        magic: RECORD_MAGIC | RECORD_VERSION as u32,
        sequence,
        time: 1_500_000_000 + sequence as u64,
        sector: 2048 + 8 * sequence as u64,
        bytes: 4096,
        action: ((CATEGORY_WRITE as u32) << CATEGORY_SHIFT) | ACTION_QUEUE as u32,
        pid: 321,
        device: (8 << 20) | 16,
        cpu: 1,
        error: 0,
        pdu_len: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode() {
        let record = sample(42);
        let decoded = TraceRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let wire = sample(1).encode();
        let err = TraceRecord::decode(&wire[..47]).unwrap_err();
        assert!(matches!(err, TraceError::MalformedRecord { len: 47 }));
        assert!(matches!(
            TraceRecord::decode(&[]),
            Err(TraceError::MalformedRecord { len: 0 })
        ));
    }

    #[test]
    fn header_helpers() {
        let record = sample(3);
        assert!(record.has_valid_magic());
        assert_eq!(record.version(), 7);
        assert_eq!(record.action_code(), 1);
        assert_eq!(record.category(), dioshark_protocol::CATEGORY_WRITE);
        assert_eq!(record.major(), 8);
        assert_eq!(record.minor(), 16);
    }

    #[test]
    fn bad_magic_still_decodes() {
        let mut record = sample(0);
        record.magic = 0xdead_beef;
        let decoded = TraceRecord::decode(&record.encode()).unwrap();
        assert!(!decoded.has_valid_magic());
    }

    #[test]
    fn display_line() {
        let line = sample(5).to_string();
        assert!(line.starts_with("  8,16 "), "{line}");
        assert!(line.contains(" Q "), "{line}");
        assert!(line.contains(" W "), "{line}");
        assert!(line.ends_with("2088 + 8"), "{line}");
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_string(&sample(9)).unwrap();
        let back: TraceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample(9));
    }
}

//! Fixed-offset reads from a serialized Basic Header Segment
//!
//! Every validation rule reads the outgoing wire bytes through these
//! functions, so each offset and mask is written down exactly once.
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!    +---------------+---------------+---------------+---------------+
//!   0|.|I| Opcode    |F|  Opcode-specific fields                     |
//!    +---------------+---------------+---------------+---------------+
//!   4|TotalAHSLength | DataSegmentLength                             |
//!    +---------------+---------------+---------------+---------------+
//!  16| Initiator Task Tag                                            |
//!    +---------------+---------------+---------------+---------------+
//! ```
//!
//! # Panics
//!
//! All functions index into the buffer without checking its length. Passing
//! fewer than [`MIN_HEADER_LEN`] bytes (or 20 bytes for
//! [`initiator_task_tag`]) is a caller bug and panics.

use byteorder::{BigEndian, ByteOrder};

/// Bytes needed for opcode, flags and DataSegmentLength
pub const MIN_HEADER_LEN: usize = 8;

const OPCODE_MASK: u8 = 0x3F;
const IMMEDIATE_BIT: u8 = 0x40;
const FINAL_BIT: u8 = 0x80;
const DATA_SEGMENT_LENGTH_MASK: u32 = 0x00FF_FFFF;

/// PDU opcode: low 6 bits of byte 0
#[inline]
pub fn opcode(buf: &[u8]) -> u8 {
    buf[0] & OPCODE_MASK
}

/// Immediate delivery bit: bit 6 of byte 0
#[inline]
pub fn is_immediate(buf: &[u8]) -> bool {
    buf[0] & IMMEDIATE_BIT != 0
}

/// Final bit: bit 7 of byte 1
#[inline]
pub fn is_final(buf: &[u8]) -> bool {
    buf[1] & FINAL_BIT != 0
}

/// DataSegmentLength in bytes: the big-endian word at offset 4 without the
/// TotalAHSLength byte
#[inline]
pub fn data_segment_length(buf: &[u8]) -> u32 {
    BigEndian::read_u32(&buf[4..8]) & DATA_SEGMENT_LENGTH_MASK
}

/// Initiator Task Tag: bytes 16-19
#[inline]
pub fn initiator_task_tag(buf: &[u8]) -> u32 {
    BigEndian::read_u32(&buf[16..20])
}

/// Borrowed view over one serialized PDU
#[derive(Debug, Clone, Copy)]
pub struct BhsView<'a> {
    bytes: &'a [u8],
}

impl<'a> BhsView<'a> {
    /// Wrap a buffer holding at least [`MIN_HEADER_LEN`] bytes
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert!(
            bytes.len() >= MIN_HEADER_LEN,
            "BHS view over {} bytes",
            bytes.len()
        );
        BhsView { bytes }
    }

    pub fn opcode(&self) -> u8 {
        opcode(self.bytes)
    }

    pub fn is_final(&self) -> bool {
        is_final(self.bytes)
    }

    pub fn data_segment_length(&self) -> u32 {
        data_segment_length(self.bytes)
    }

    pub fn is_immediate(&self) -> bool {
        is_immediate(self.bytes)
    }

    /// The raw bytes, for diagnostics
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

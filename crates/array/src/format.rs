//! Array block layout.
//!
//! ```text
//! [magic: u32 LE][max_entries: u32 LE][nr_entries: u32 LE][value_size: u32 LE]
//! [values: max_entries x value_size bytes]
//! ```
//!
//! Values are opaque bytes in their on-disk encoding. Only the first
//! `nr_entries` slots are meaningful.

use block::{BlockError, BlockId};
use byteorder::{ByteOrder, LittleEndian};

/// Magic number identifying array blocks (ASCII "ARRY").
pub const ARRAY_BLOCK_MAGIC: u32 = 0x4152_5259;

/// Size of the array block header in bytes: 4 x `u32`.
pub const ARRAY_HEADER_BYTES: usize = 4 * 4;

/// Values of `value_size` bytes that fit in a payload of `payload_size`.
pub fn max_entries(payload_size: usize, value_size: usize) -> usize {
    payload_size.saturating_sub(ARRAY_HEADER_BYTES) / value_size.max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub max_entries: usize,
    pub nr_entries: usize,
    pub value_size: usize,
}

/// Formats `buf` as an array block holding no values.
pub(crate) fn init(buf: &mut [u8], max_entries: usize, value_size: usize) {
    buf.fill(0);
    LittleEndian::write_u32(&mut buf[0..4], ARRAY_BLOCK_MAGIC);
    LittleEndian::write_u32(&mut buf[4..8], max_entries as u32);
    LittleEndian::write_u32(&mut buf[8..12], 0);
    LittleEndian::write_u32(&mut buf[12..16], value_size as u32);
}

/// Validates the header of block `id` against the expected value size.
pub(crate) fn read_header(id: BlockId, buf: &[u8], value_size: usize) -> Result<Header, BlockError> {
    let corrupt = |reason: String| BlockError::Corrupt { block: id, reason };

    if buf.len() < ARRAY_HEADER_BYTES {
        return Err(corrupt("too small for an array block header".into()));
    }
    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != ARRAY_BLOCK_MAGIC {
        return Err(corrupt(format!("bad array block magic {:#010x}", magic)));
    }

    let h = Header {
        max_entries: LittleEndian::read_u32(&buf[4..8]) as usize,
        nr_entries: LittleEndian::read_u32(&buf[8..12]) as usize,
        value_size: LittleEndian::read_u32(&buf[12..16]) as usize,
    };
    if h.value_size != value_size {
        return Err(corrupt(format!(
            "value size {} does not match {}",
            h.value_size, value_size
        )));
    }
    if h.nr_entries > h.max_entries || ARRAY_HEADER_BYTES + h.max_entries * h.value_size > buf.len() {
        return Err(corrupt(format!(
            "{} of {} values do not fit",
            h.nr_entries, h.max_entries
        )));
    }
    Ok(h)
}

pub(crate) fn set_nr_entries(buf: &mut [u8], nr_entries: usize) {
    LittleEndian::write_u32(&mut buf[8..12], nr_entries as u32);
}

pub(crate) fn value(buf: &[u8], value_size: usize, i: usize) -> &[u8] {
    let off = ARRAY_HEADER_BYTES + i * value_size;
    &buf[off..off + value_size]
}

pub(crate) fn value_mut(buf: &mut [u8], value_size: usize, i: usize) -> &mut [u8] {
    let off = ARRAY_HEADER_BYTES + i * value_size;
    &mut buf[off..off + value_size]
}

//! On-device block framing.
//!
//! ```text
//! [crc32: u32 LE][block_id: u64 LE][payload: block_size - 12 bytes]
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::{BlockError, BlockId};

/// Bytes taken by the frame header: 4 (`crc32`) + 8 (`block_id`).
pub const FRAME_HEADER_BYTES: usize = 4 + 8;

fn checksum(id_and_payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(id_and_payload);
    hasher.finalize()
}

/// Writes `payload` framed for block `id` into `out`.
///
/// `out` must be exactly `payload.len() + FRAME_HEADER_BYTES` long.
pub(crate) fn encode(id: BlockId, payload: &[u8], out: &mut [u8]) {
    debug_assert_eq!(out.len(), payload.len() + FRAME_HEADER_BYTES);

    LittleEndian::write_u64(&mut out[4..12], id);
    out[FRAME_HEADER_BYTES..].copy_from_slice(payload);
    let crc = checksum(&out[4..]);
    LittleEndian::write_u32(&mut out[0..4], crc);
}

/// Verifies a raw block read for `id` and returns its payload.
pub(crate) fn decode(id: BlockId, raw: &[u8]) -> Result<&[u8], BlockError> {
    if raw.len() < FRAME_HEADER_BYTES {
        return Err(BlockError::Corrupt {
            block: id,
            reason: format!("{} bytes is smaller than the frame header", raw.len()),
        });
    }

    let stored_crc = LittleEndian::read_u32(&raw[0..4]);
    let actual_crc = checksum(&raw[4..]);
    if stored_crc != actual_crc {
        return Err(BlockError::Corrupt {
            block: id,
            reason: format!(
                "CRC32 mismatch: expected {:#010x}, got {:#010x}",
                stored_crc, actual_crc
            ),
        });
    }

    let stored_id = LittleEndian::read_u64(&raw[4..12]);
    if stored_id != id {
        return Err(BlockError::Corrupt {
            block: id,
            reason: format!("block claims to be {}", stored_id),
        });
    }

    Ok(&raw[FRAME_HEADER_BYTES..])
}

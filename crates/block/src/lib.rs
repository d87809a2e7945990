//! # Block - Transactional Block Store
//!
//! The storage layer underneath the B-tree, array and bitset crates. It hands
//! out fixed-size blocks, counts references to them, and enforces the
//! copy-on-write discipline that keeps every published root immutable.
//!
//! ## Transactions
//!
//! ```text
//!  commit()                                             commit()
//!     |                                                    |
//!     v   new_block / shadow / write / inc / dec           v
//!  ---+----------------------------------------------------+---
//!     |  blocks created or shadowed here are writable      |
//!     |  blocks from earlier transactions are read-only    |
//!     |  blocks dropping to zero refs stay readable        |
//!     |  until the commit, then return to the free list    |
//! ```
//!
//! [`TransactionManager::abort`] throws away everything since the last
//! commit: reference counts, allocations and written blocks.
//!
//! ## Block framing
//!
//! ```text
//! [crc32: u32 LE][block_id: u64 LE][payload ...]
//! ```
//!
//! The CRC32 covers the block id and the payload, so both bit rot and a block
//! read from the wrong location are detected. Layers above only see the
//! payload, [`TransactionManager::payload_size`] bytes long.

mod device;
mod frame;
mod manager;

pub use device::{Device, FileDevice, MemDevice};
pub use frame::FRAME_HEADER_BYTES;
pub use manager::{BlockRef, Savepoint, TransactionManager};

use std::io;
use thiserror::Error;

/// Location of a block on the device.
pub type BlockId = u64;

/// Errors raised by the block store.
///
/// Everything in here is a storage failure from the point of view of the
/// layers above; none of it is retried.
#[derive(Debug, Error)]
pub enum BlockError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Checksum, location or format mismatch.
    #[error("block {block} is corrupt: {reason}")]
    Corrupt { block: BlockId, reason: String },

    /// The device has no unallocated blocks left.
    #[error("no free blocks (capacity {0})")]
    NoSpace(u64),

    /// The block belongs to an earlier transaction and must be shadowed first.
    #[error("block {0} is not writable in this transaction")]
    ReadOnly(BlockId),

    /// The block was never allocated, or has been released and recycled.
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    /// A payload of the wrong length was handed to `write`.
    #[error("payload of {got} bytes does not match block payload size {want}")]
    Size { got: usize, want: usize },

    /// The store configuration was rejected.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests;

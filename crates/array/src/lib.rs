//! # Array - Persistent Fixed-Stride Arrays
//!
//! A dense array of fixed-width values laid out on top of the copy-on-write
//! [`BTree`]. Values are packed into array blocks of
//! [`ArrayInfo::max_entries`] slots each, and the tree maps a block index to
//! the array block holding indices
//! `[block_index * max_entries, block_index * max_entries + nr_entries)`.
//! Every block but the last is full.
//!
//! ## Roots and sizes
//!
//! Every update takes a root and returns a new one. The array does not
//! record its own length: callers keep the size next to the root and pass it
//! to [`ArrayInfo::resize`].
//!
//! ```text
//!   root ──► btree ──► [0] array block: v0 v1 .. v(m-1)
//!                  ──► [1] array block: vm .. v(2m-1)
//!                  ──► [2] array block: v2m .. (partial)
//! ```
//!
//! ## Reference counting
//!
//! A [`ValueType`] describes the stored values. Its `inc`/`dec` hooks run
//! whenever a value is copied into or dropped from an array, so values may
//! be handles into other reference-counted structures.
//!
//! ## Failures
//!
//! Every update runs under a [`Savepoint`](block::Savepoint). When it fails
//! the savepoint is rolled back: the input root, its reference counts and
//! the allocator are exactly as they were, and no [`ValueType`] hook has
//! run. Hooks are staged while an update runs and delivered once it has
//! succeeded.

mod cursor;
mod format;
mod read;
mod write;

pub use block::{BlockError, BlockId, TransactionManager};
pub use cursor::ArrayCursor;
pub use format::{ARRAY_BLOCK_MAGIC, ARRAY_HEADER_BYTES};

use std::sync::Arc;

use btree::{BTree, ValueRefs};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use radix::SortError;
use thiserror::Error;

/// Errors returned by array operations.
#[derive(Debug, Error)]
pub enum ArrayError {
    /// The index is past the end of the array.
    #[error("index {index} is out of range")]
    NotFound { index: u64 },

    /// A cursor moved past the last element.
    #[error("end of data")]
    EndOfData,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by the block store.
    #[error(transparent)]
    Storage(#[from] BlockError),

    /// Presorting a batch of updates failed.
    #[error(transparent)]
    Sort(#[from] SortError),
}

/// Describes the values stored in an array.
pub trait ValueType: Send + Sync {
    /// Width of every value in bytes.
    fn size(&self) -> usize;

    /// A copy of `value` was stored.
    fn inc(&self, _value: &[u8]) {}

    /// A stored copy of `value` was dropped.
    fn dec(&self, _value: &[u8]) {}

    /// Whether overwriting `old` with `new` can skip the `dec`/`inc` pair.
    fn equal(&self, _old: &[u8], _new: &[u8]) -> bool {
        false
    }
}

/// Values without reference counts.
#[derive(Debug, Clone, Copy)]
pub struct PlainValue {
    size: usize,
}

impl PlainValue {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ValueType for PlainValue {
    fn size(&self) -> usize {
        self.size
    }

    fn equal(&self, old: &[u8], new: &[u8]) -> bool {
        old == new
    }
}

/// Little-endian `u64` values without reference counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Le64Value;

impl Le64Value {
    pub fn encode(value: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        buf
    }

    pub fn decode(bytes: &[u8]) -> u64 {
        LittleEndian::read_u64(bytes)
    }
}

impl ValueType for Le64Value {
    fn size(&self) -> usize {
        8
    }

    fn equal(&self, old: &[u8], new: &[u8]) -> bool {
        old == new
    }
}

enum HookCall {
    Inc { value: Vec<u8>, times: u64 },
    Dec(Vec<u8>),
}

/// [`ValueType`] hook calls made by the running update, held back until it
/// succeeds.
struct Hooks {
    vt: Arc<dyn ValueType>,
    staged: Mutex<Vec<HookCall>>,
}

impl Hooks {
    fn inc(&self, value: &[u8], times: u64) {
        if times > 0 {
            self.staged.lock().push(HookCall::Inc {
                value: value.to_vec(),
                times,
            });
        }
    }

    fn dec(&self, value: &[u8]) {
        self.staged.lock().push(HookCall::Dec(value.to_vec()));
    }

    /// Delivers the staged calls in the order they were made.
    fn deliver(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        for call in staged {
            match call {
                HookCall::Inc { value, times } => {
                    for _ in 0..times {
                        self.vt.inc(&value);
                    }
                }
                HookCall::Dec(value) => self.vt.dec(&value),
            }
        }
    }

    fn discard(&self) {
        self.staged.lock().clear();
    }
}

/// Reference hooks for the tree's leaf values, which are array blocks.
///
/// Dropping the last reference to an array block drops every value in it.
struct ArrayBlockRefs {
    tm: Arc<TransactionManager>,
    hooks: Arc<Hooks>,
}

impl ValueRefs for ArrayBlockRefs {
    fn inc(&self, block: u64) -> Result<(), BlockError> {
        self.tm.inc(block)
    }

    fn dec(&self, block: u64) -> Result<(), BlockError> {
        if self.tm.ref_count(block) == 1 {
            let size = self.hooks.vt.size();
            let data = self.tm.read(block)?;
            let h = format::read_header(block, &data, size)?;
            for i in 0..h.nr_entries {
                self.hooks.dec(format::value(&data, size, i));
            }
        }
        self.tm.dec(block)
    }
}

/// Configuration shared by every array of one value type.
///
/// Holds no per-array state: the same `ArrayInfo` serves any number of
/// roots, and it may be cloned and shared across threads.
#[derive(Clone)]
pub struct ArrayInfo {
    tm: Arc<TransactionManager>,
    vt: Arc<dyn ValueType>,
    hooks: Arc<Hooks>,
    tree: BTree,
    max_entries: usize,
}

impl ArrayInfo {
    /// Ties `vt` to a transaction manager. Performs no I/O.
    pub fn new(tm: Arc<TransactionManager>, vt: Arc<dyn ValueType>) -> Result<Self, ArrayError> {
        let size = vt.size();
        let max_entries = format::max_entries(tm.payload_size(), size);
        if size == 0 || max_entries == 0 {
            return Err(ArrayError::InvalidArgument(format!(
                "values of {} bytes do not fit a {} byte block",
                size,
                tm.block_size()
            )));
        }

        let hooks = Arc::new(Hooks {
            vt: Arc::clone(&vt),
            staged: Mutex::new(Vec::new()),
        });
        let refs = Arc::new(ArrayBlockRefs {
            tm: Arc::clone(&tm),
            hooks: Arc::clone(&hooks),
        });
        Ok(Self {
            tree: BTree::new(Arc::clone(&tm), refs),
            tm,
            vt,
            hooks,
            max_entries,
        })
    }

    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn value_type(&self) -> &Arc<dyn ValueType> {
        &self.vt
    }

    /// Width of one value in bytes.
    pub fn value_size(&self) -> usize {
        self.vt.size()
    }

    /// Values per array block.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of array blocks holding an array of `size` values.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.max_entries as u64)
    }

    pub(crate) fn tree(&self) -> &BTree {
        &self.tree
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Runs `update` under a savepoint: on success the staged hooks are
    /// delivered, on failure every change is rolled back.
    pub(crate) fn atomically<T, F>(&self, update: F) -> Result<T, ArrayError>
    where
        F: FnOnce() -> Result<T, ArrayError>,
    {
        let savepoint = self.tm.savepoint();
        match update() {
            Ok(out) => {
                self.hooks.deliver();
                savepoint.release();
                Ok(out)
            }
            Err(e) => {
                self.hooks.discard();
                savepoint.rollback();
                Err(e)
            }
        }
    }

    /// Splits an index into `(block_index, entry)`.
    pub(crate) fn locate(&self, index: u64) -> (u64, usize) {
        let max = self.max_entries as u64;
        (index / max, (index % max) as usize)
    }

    pub(crate) fn check_value(&self, value: &[u8]) -> Result<(), ArrayError> {
        if value.len() != self.vt.size() {
            return Err(ArrayError::InvalidArgument(format!(
                "value of {} bytes, expected {}",
                value.len(),
                self.vt.size()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ArrayInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayInfo")
            .field("value_size", &self.vt.size())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests;

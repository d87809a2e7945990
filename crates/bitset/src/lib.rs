//! # Bitset - Persistent Bitsets
//!
//! A bit-addressable view over an array of little-endian `u64` words. Bit
//! `i` lives in word `i / 64` at position `i % 64`.
//!
//! ## The word cache
//!
//! A [`DiskBitset`] handle caches one word so that runs of nearby bit
//! operations do not each go through the tree:
//!
//! ```text
//!            read/write word w                write, same word
//!   Empty ──────────────────────► Clean ───────────────────► Dirty
//!                                   ▲                          │
//!                                   └──────── flush() ─────────┘
//!
//!   any state, access to another word: flush(), then load that word
//! ```
//!
//! Because of the implicit flush, even [`DiskBitset::test_bit`] may return
//! a different root than the one it was given. Always continue with the
//! returned root.
//!
//! A handle caches a word of whichever bitset it last touched; use one
//! handle per bitset and flush before handing the root to anyone else.

mod cursor;

pub use array::{ArrayError, ArrayInfo};
pub use block::{BlockId, TransactionManager};
pub use cursor::BitsetCursor;

use std::sync::Arc;

use array::Le64Value;
use tracing::trace;

/// Bits per word.
pub const BITS_PER_WORD: u64 = 64;

/// Words holding `nr_bits` bits.
pub fn word_count(nr_bits: u64) -> u64 {
    nr_bits.div_ceil(BITS_PER_WORD)
}

fn locate(index: u64) -> (u64, u32) {
    (index / BITS_PER_WORD, (index % BITS_PER_WORD) as u32)
}

/// State of the one-word cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Empty,
    /// Matches the word stored under the current root.
    Clean { index: u64, bits: u64 },
    /// Modified; the stored word is stale until the next flush.
    Dirty { index: u64, bits: u64 },
}

/// A bitset handle: the array configuration plus the word cache.
pub struct DiskBitset {
    info: ArrayInfo,
    cache: CacheState,
}

impl DiskBitset {
    pub fn new(tm: Arc<TransactionManager>) -> Result<Self, ArrayError> {
        Ok(Self {
            info: ArrayInfo::new(tm, Arc::new(Le64Value))?,
            cache: CacheState::Empty,
        })
    }

    /// The word array underneath.
    pub fn info(&self) -> &ArrayInfo {
        &self.info
    }

    /// Whether the cached word has changes not yet written to a root.
    pub fn is_dirty(&self) -> bool {
        matches!(self.cache, CacheState::Dirty { .. })
    }

    /// The cached `(word_index, bits)`, if any.
    pub fn cached_word(&self) -> Option<(u64, u64)> {
        match self.cache {
            CacheState::Empty => None,
            CacheState::Clean { index, bits } | CacheState::Dirty { index, bits } => {
                Some((index, bits))
            }
        }
    }

    /// Creates an empty bitset.
    pub fn empty(&self) -> Result<BlockId, ArrayError> {
        self.info.empty()
    }

    /// Grows or shrinks the bitset from `old_nr_bits` to `new_nr_bits`.
    ///
    /// New bits read as `default`, including those in the partially used
    /// last word of the old bitset. Shrinking only drops whole words; bits
    /// past `new_nr_bits` in the last word keep their values.
    ///
    /// On failure nothing changes: neither the stored bitset nor the cached
    /// word.
    pub fn resize(
        &mut self,
        root: BlockId,
        old_nr_bits: u64,
        new_nr_bits: u64,
        default: bool,
    ) -> Result<BlockId, ArrayError> {
        let tm = Arc::clone(self.info.tm());
        let savepoint = tm.savepoint();
        let cache = self.cache;

        match self.resize_words(root, old_nr_bits, new_nr_bits, default) {
            Ok(root) => {
                savepoint.release();
                Ok(root)
            }
            Err(e) => {
                self.cache = cache;
                savepoint.rollback();
                Err(e)
            }
        }
    }

    fn resize_words(
        &mut self,
        root: BlockId,
        old_nr_bits: u64,
        new_nr_bits: u64,
        default: bool,
    ) -> Result<BlockId, ArrayError> {
        let mut root = self.flush(root)?;
        self.cache = CacheState::Empty;

        let tail = old_nr_bits % BITS_PER_WORD;
        if new_nr_bits > old_nr_bits && tail != 0 {
            let last = old_nr_bits / BITS_PER_WORD;
            let word = Le64Value::decode(&self.info.get_value(root, last)?);
            let mask = u64::MAX << tail;
            let word = if default { word | mask } else { word & !mask };
            root = self.info.set_value(root, last, &Le64Value::encode(word))?;
        }

        let fill = if default { u64::MAX } else { 0 };
        self.info.resize(
            root,
            word_count(old_nr_bits),
            word_count(new_nr_bits),
            &Le64Value::encode(fill),
        )
    }

    /// Builds a bitset of `nr_bits` bits, asking `generate` for each bit in
    /// index order.
    pub fn new_populated<F>(&self, nr_bits: u64, mut generate: F) -> Result<BlockId, ArrayError>
    where
        F: FnMut(u64) -> Result<bool, ArrayError>,
    {
        self.info.new_populated(word_count(nr_bits), |word_index, out| {
            let first = word_index * BITS_PER_WORD;
            let last = (first + BITS_PER_WORD).min(nr_bits);
            let mut bits = 0u64;
            for index in first..last {
                if generate(index)? {
                    bits |= 1 << (index - first);
                }
            }
            out.copy_from_slice(&Le64Value::encode(bits));
            Ok(())
        })
    }

    /// Deletes the bitset at `root`, dropping any cached word.
    pub fn del(&mut self, root: BlockId) -> Result<(), ArrayError> {
        self.cache = CacheState::Empty;
        self.info.del(root)
    }

    /// Writes a dirty cached word back, returning the resulting root.
    ///
    /// With nothing dirty this returns `root` unchanged.
    pub fn flush(&mut self, root: BlockId) -> Result<BlockId, ArrayError> {
        let CacheState::Dirty { index, bits } = self.cache else {
            return Ok(root);
        };

        let root = self.info.set_value(root, index, &Le64Value::encode(bits))?;
        self.cache = CacheState::Clean { index, bits };
        trace!(root, word = index, "flushed bitset word");
        Ok(root)
    }

    /// Sets bit `index`.
    pub fn set_bit(&mut self, root: BlockId, index: u64) -> Result<BlockId, ArrayError> {
        let (word, bit) = locate(index);
        let (root, bits) = self.load(root, word, index)?;
        self.cache = CacheState::Dirty {
            index: word,
            bits: bits | (1 << bit),
        };
        Ok(root)
    }

    /// Clears bit `index`.
    pub fn clear_bit(&mut self, root: BlockId, index: u64) -> Result<BlockId, ArrayError> {
        let (word, bit) = locate(index);
        let (root, bits) = self.load(root, word, index)?;
        self.cache = CacheState::Dirty {
            index: word,
            bits: bits & !(1 << bit),
        };
        Ok(root)
    }

    /// Reads bit `index`.
    pub fn test_bit(&mut self, root: BlockId, index: u64) -> Result<(BlockId, bool), ArrayError> {
        let (word, bit) = locate(index);
        let (root, bits) = self.load(root, word, index)?;
        Ok((root, bits & (1 << bit) != 0))
    }

    /// Brings `word` into the cache, flushing any other dirty word.
    ///
    /// The word is read before the flush so that an out-of-range `bit`
    /// leaves the handle and the caller's root as they were.
    fn load(&mut self, root: BlockId, word: u64, bit: u64) -> Result<(BlockId, u64), ArrayError> {
        if let Some((index, bits)) = self.cached_word() {
            if index == word {
                return Ok((root, bits));
            }
        }

        let bits = match self.info.get_value(root, word) {
            Ok(v) => Le64Value::decode(&v),
            Err(ArrayError::NotFound { .. }) => return Err(ArrayError::NotFound { index: bit }),
            Err(e) => return Err(e),
        };
        let root = self.flush(root)?;
        self.cache = CacheState::Clean { index: word, bits };
        Ok((root, bits))
    }
}

impl std::fmt::Debug for DiskBitset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBitset")
            .field("cache", &self.cache)
            .finish()
    }
}

use array::{ArrayCursor, ArrayError, Le64Value};
use block::BlockId;

use crate::{DiskBitset, BITS_PER_WORD};

/// Forward iteration over the bits of one bitset root.
///
/// Reads each word once through an [`ArrayCursor`] and serves the bits of
/// that word from a local copy.
pub struct BitsetCursor {
    words: ArrayCursor,
    /// Bits left, the current one included.
    entries_remaining: u64,
    bit_index: u64,
    current_bits: u64,
}

impl BitsetCursor {
    /// Positions a cursor on bit 0 of a bitset of `nr_bits` bits.
    ///
    /// # Errors
    ///
    /// [`ArrayError::InvalidArgument`] if `bitset` holds a dirty word: flush
    /// it and pass the returned root. [`ArrayError::EndOfData`] if `nr_bits`
    /// is zero.
    pub fn begin(bitset: &DiskBitset, root: BlockId, nr_bits: u64) -> Result<Self, ArrayError> {
        if bitset.is_dirty() {
            return Err(ArrayError::InvalidArgument(
                "bitset has unflushed changes".into(),
            ));
        }
        if nr_bits == 0 {
            return Err(ArrayError::EndOfData);
        }

        let words = ArrayCursor::begin(bitset.info(), root)?;
        let current_bits = Le64Value::decode(words.value());
        Ok(Self {
            words,
            entries_remaining: nr_bits,
            bit_index: 0,
            current_bits,
        })
    }

    /// Moves to the next bit.
    pub fn next(&mut self) -> Result<(), ArrayError> {
        self.skip(1)
    }

    /// Moves forward `count` bits.
    ///
    /// If the words run out before `count` bits are reached (the bitset is
    /// shorter than the `nr_bits` given to [`begin`](Self::begin)), the
    /// cursor is left on bit 0 of the last word it reached.
    pub fn skip(&mut self, count: u64) -> Result<(), ArrayError> {
        if count >= self.entries_remaining {
            return Err(ArrayError::EndOfData);
        }

        let target = self.bit_index + count;
        if target >= BITS_PER_WORD {
            let word = self.words.index();
            let skipped = self.words.skip(target / BITS_PER_WORD);
            let moved = self.words.index() - word;
            if let Err(e) = skipped {
                // Follow the word cursor to bit 0 of wherever it stopped.
                if moved > 0 {
                    self.entries_remaining -= moved * BITS_PER_WORD - self.bit_index;
                    self.bit_index = 0;
                    self.current_bits = Le64Value::decode(self.words.value());
                }
                return Err(e);
            }
            self.current_bits = Le64Value::decode(self.words.value());
        }
        self.entries_remaining -= count;
        self.bit_index = target % BITS_PER_WORD;
        Ok(())
    }

    /// Index of the current bit.
    pub fn index(&self) -> u64 {
        self.words.index() * BITS_PER_WORD + self.bit_index
    }

    /// The current bit.
    pub fn value(&self) -> bool {
        self.current_bits & (1 << self.bit_index) != 0
    }

    /// Releases the cursor's pins.
    pub fn end(self) {}
}

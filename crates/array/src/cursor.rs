use std::sync::Arc;

use block::{BlockId, BlockRef, TransactionManager};
use btree::BTreeCursor;

use crate::format::{self, Header};
use crate::{ArrayError, ArrayInfo};

/// Forward iteration over the values of one array root.
///
/// The current array block stays pinned while the cursor is on it; moving
/// past its last value steps the underlying tree cursor to the next block.
/// After [`ArrayError::EndOfData`] the cursor stays on the last value it
/// reached. Dropping the cursor (or calling [`end`](Self::end)) releases
/// every pin.
pub struct ArrayCursor {
    tm: Arc<TransactionManager>,
    tree: BTreeCursor,
    block: BlockRef,
    header: Header,
    block_index: u64,
    entry: usize,
    max_entries: usize,
}

impl ArrayCursor {
    /// Positions a cursor on index 0 of `root`.
    ///
    /// # Errors
    ///
    /// [`ArrayError::EndOfData`] if the array is empty.
    pub fn begin(info: &ArrayInfo, root: BlockId) -> Result<Self, ArrayError> {
        let tree = BTreeCursor::begin(info.tree(), root)?;
        let (block_index, ab) = tree.get().ok_or(ArrayError::EndOfData)?;
        let block = info.tm().read(ab)?;
        let header = format::read_header(ab, &block, info.value_size())?;
        if header.nr_entries == 0 {
            return Err(ArrayError::EndOfData);
        }

        Ok(Self {
            tm: Arc::clone(info.tm()),
            tree,
            block,
            header,
            block_index,
            entry: 0,
            max_entries: info.max_entries(),
        })
    }

    /// Moves to the next value.
    pub fn next(&mut self) -> Result<(), ArrayError> {
        self.skip(1)
    }

    /// Moves forward `count` values. Full blocks in between are stepped over
    /// without being read.
    pub fn skip(&mut self, count: u64) -> Result<(), ArrayError> {
        let left_in_block = (self.header.nr_entries - 1 - self.entry) as u64;
        if count <= left_in_block {
            self.entry += count as usize;
            return Ok(());
        }

        // Offset from the start of the next block; every block before the
        // last is full.
        let rest = count - left_in_block - 1;
        let max = self.max_entries as u64;
        if !self.tree.skip(1 + rest / max)? {
            self.entry = self.header.nr_entries - 1;
            return Err(ArrayError::EndOfData);
        }
        self.load()?;

        let entry = (rest % max) as usize;
        if entry >= self.header.nr_entries {
            self.entry = self.header.nr_entries - 1;
            return Err(ArrayError::EndOfData);
        }
        self.entry = entry;
        Ok(())
    }

    /// Index of the current value.
    pub fn index(&self) -> u64 {
        self.block_index * self.max_entries as u64 + self.entry as u64
    }

    /// The current value. Borrowed from the pinned block, so it cannot
    /// outlive the next move.
    pub fn value(&self) -> &[u8] {
        format::value(&self.block, self.header.value_size, self.entry)
    }

    /// Releases the cursor's pins.
    pub fn end(self) {}

    fn load(&mut self) -> Result<(), ArrayError> {
        let (block_index, ab) = self.tree.get().ok_or(ArrayError::EndOfData)?;
        let block = self.tm.read(ab)?;
        let header = format::read_header(ab, &block, self.header.value_size)?;
        if header.nr_entries == 0 {
            return Err(ArrayError::EndOfData);
        }
        self.block = block;
        self.header = header;
        self.block_index = block_index;
        self.entry = 0;
        Ok(())
    }
}

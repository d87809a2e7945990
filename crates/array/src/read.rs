use block::BlockId;

use crate::{format, ArrayError, ArrayInfo};

impl ArrayInfo {
    /// Reads the value at `index`.
    ///
    /// # Errors
    ///
    /// [`ArrayError::NotFound`] if `index` is past the end of the array.
    pub fn get_value(&self, root: BlockId, index: u64) -> Result<Vec<u8>, ArrayError> {
        let (block_index, entry) = self.locate(index);
        let ab = self
            .tree()
            .lookup(root, block_index)?
            .ok_or(ArrayError::NotFound { index })?;

        let data = self.tm().read(ab)?;
        let h = format::read_header(ab, &data, self.value_size())?;
        if entry >= h.nr_entries {
            return Err(ArrayError::NotFound { index });
        }
        Ok(format::value(&data, h.value_size, entry).to_vec())
    }

    /// Visits every `(index, value)` in index order, one array block at a
    /// time. Stops at the first error returned by `f`.
    pub fn walk<F>(&self, root: BlockId, mut f: F) -> Result<(), ArrayError>
    where
        F: FnMut(u64, &[u8]) -> Result<(), ArrayError>,
    {
        let max = self.max_entries() as u64;
        let size = self.value_size();

        self.tree().walk(root, |block_index, ab| {
            let data = self.tm().read(ab)?;
            let h = format::read_header(ab, &data, size)?;
            let base = block_index * max;
            for i in 0..h.nr_entries {
                f(base + i as u64, format::value(&data, size, i))?;
            }
            Ok(())
        })
    }
}

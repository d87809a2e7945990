use block::BlockId;
use byteorder::{BigEndian, ByteOrder};
use radix::RadixSorter;
use tracing::debug;

use crate::{format, ArrayError, ArrayInfo};

/// Sort key of a batched update: big-endian index, then big-endian position
/// in the batch, so that equal indices keep batch order.
const UPDATE_KEY_BYTES: usize = 8 + 4;

/// An array block made writable by [`ArrayInfo::shadow_ablock`].
struct Shadowed {
    root: BlockId,
    id: BlockId,
    data: Vec<u8>,
    nr_entries: usize,
}

impl ArrayInfo {
    /// Creates an empty, zero-length array.
    pub fn empty(&self) -> Result<BlockId, ArrayError> {
        self.atomically(|| Ok(self.tree().empty()?))
    }

    /// Grows or shrinks the array from `old_size` to `new_size` values.
    ///
    /// New slots hold `default`, which is passed to [`ValueType::inc`] once
    /// per slot. Dropped slots are passed to [`ValueType::dec`].
    ///
    /// [`ValueType::inc`]: crate::ValueType::inc
    /// [`ValueType::dec`]: crate::ValueType::dec
    pub fn resize(
        &self,
        root: BlockId,
        old_size: u64,
        new_size: u64,
        default: &[u8],
    ) -> Result<BlockId, ArrayError> {
        self.check_value(default)?;
        if old_size == new_size {
            return Ok(root);
        }

        debug!(root, old_size, new_size, "resizing array");
        self.atomically(|| {
            if new_size < old_size {
                self.shrink(root, old_size, new_size)
            } else {
                self.grow(root, old_size, new_size, default)
            }
        })
    }

    /// Builds an array of `size` values, asking `generate` for each one in
    /// index order.
    ///
    /// Generated values are stored as they are, without [`ValueType::inc`];
    /// the array takes over the caller's reference. If the build fails,
    /// every block allocated so far is released. Values already generated
    /// are passed to [`ValueType::dec`] when `generate` itself failed; after
    /// a storage failure they are not, and stay with the caller.
    ///
    /// [`ValueType::inc`]: crate::ValueType::inc
    /// [`ValueType::dec`]: crate::ValueType::dec
    pub fn new_populated<F>(&self, size: u64, mut generate: F) -> Result<BlockId, ArrayError>
    where
        F: FnMut(u64, &mut [u8]) -> Result<(), ArrayError>,
    {
        let max = self.max_entries() as u64;
        let vsize = self.value_size();

        self.atomically(|| {
            let mut root = self.tree().empty()?;
            for block_index in 0..self.block_count(size) {
                let base = block_index * max;
                let count = (size - base).min(max) as usize;

                let mut data = vec![0u8; self.tm().payload_size()];
                format::init(&mut data, self.max_entries(), vsize);
                for i in 0..count {
                    if let Err(e) = generate(base + i as u64, format::value_mut(&mut data, vsize, i)) {
                        // The values generated so far are owned by the array.
                        for j in 0..i {
                            self.value_type().dec(format::value(&data, vsize, j));
                        }
                        self.tree().walk(root, |_, ab| {
                            let block = self.tm().read(ab)?;
                            let h = format::read_header(ab, &block, vsize)?;
                            for j in 0..h.nr_entries {
                                self.value_type().dec(format::value(&block, vsize, j));
                            }
                            Ok::<(), ArrayError>(())
                        })?;
                        return Err(e);
                    }
                }
                format::set_nr_entries(&mut data, count);

                let ab = self.tm().new_block()?;
                self.tm().write(ab, data)?;
                root = self.tree().insert(root, block_index, ab)?.0;
            }
            Ok(root)
        })
    }

    /// Overwrites the value at `index`.
    ///
    /// The old value is passed to [`ValueType::dec`] and the new one to
    /// [`ValueType::inc`], unless [`ValueType::equal`] reports them equal.
    ///
    /// [`ValueType::inc`]: crate::ValueType::inc
    /// [`ValueType::dec`]: crate::ValueType::dec
    /// [`ValueType::equal`]: crate::ValueType::equal
    pub fn set_value(&self, root: BlockId, index: u64, value: &[u8]) -> Result<BlockId, ArrayError> {
        self.check_value(value)?;
        let (block_index, entry) = self.locate(index);
        self.check_index(root, index)?;

        self.atomically(|| {
            let mut ab = self.shadow_ablock(root, block_index)?;
            self.replace(&mut ab.data, entry, value);
            self.tm().write(ab.id, ab.data)?;
            Ok(ab.root)
        })
    }

    /// Applies a batch of `(index, value)` updates.
    ///
    /// The batch is sorted by index first so every touched array block is
    /// shadowed and written once. When an index appears more than once the
    /// last update wins. Every index is checked before anything changes.
    pub fn set_values(&self, root: BlockId, updates: &[(u64, &[u8])]) -> Result<BlockId, ArrayError> {
        if updates.is_empty() {
            return Ok(root);
        }
        for (index, value) in updates {
            self.check_value(value)?;
            self.check_index(root, *index)?;
        }

        let keys: Vec<[u8; UPDATE_KEY_BYTES]> = updates
            .iter()
            .enumerate()
            .map(|(pos, (index, _))| {
                let mut key = [0u8; UPDATE_KEY_BYTES];
                BigEndian::write_u64(&mut key[..8], *index);
                BigEndian::write_u32(&mut key[8..], pos as u32);
                key
            })
            .collect();
        let mut order: Vec<&[u8]> = keys.iter().map(|k| &k[..]).collect();
        RadixSorter::new(order.len())?.sort(&mut order, UPDATE_KEY_BYTES)?;

        let mut latest: Vec<(u64, usize)> = Vec::with_capacity(order.len());
        for key in &order {
            let index = BigEndian::read_u64(&key[..8]);
            let pos = BigEndian::read_u32(&key[8..]) as usize;
            match latest.last_mut() {
                Some(last) if last.0 == index => last.1 = pos,
                _ => latest.push((index, pos)),
            }
        }

        self.atomically(|| {
            let mut root = root;
            let mut i = 0;
            while i < latest.len() {
                let (block_index, _) = self.locate(latest[i].0);
                let mut ab = self.shadow_ablock(root, block_index)?;
                while i < latest.len() && self.locate(latest[i].0).0 == block_index {
                    let (index, pos) = latest[i];
                    self.replace(&mut ab.data, self.locate(index).1, updates[pos].1);
                    i += 1;
                }
                self.tm().write(ab.id, ab.data)?;
                root = ab.root;
            }
            Ok(root)
        })
    }

    /// Drops the caller's reference to the array, releasing every value the
    /// array alone held.
    pub fn del(&self, root: BlockId) -> Result<(), ArrayError> {
        self.atomically(|| Ok(self.tree().del(root)?))
    }

    // ---- Internal helpers ----

    fn check_index(&self, root: BlockId, index: u64) -> Result<(), ArrayError> {
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
        Ok(())
    }

    /// Stores `value` in slot `entry`, releasing the old value.
    fn replace(&self, data: &mut [u8], entry: usize, value: &[u8]) {
        let slot = format::value_mut(data, self.value_size(), entry);
        if !self.value_type().equal(slot, value) {
            self.hooks().dec(slot);
            self.hooks().inc(value, 1);
        }
        slot.copy_from_slice(value);
    }

    /// Makes array block `block_index` writable and points the tree at it.
    ///
    /// The tree path is shadowed first so a copied leaf takes its own
    /// reference to the array block before that block is shadowed.
    fn shadow_ablock(&self, root: BlockId, block_index: u64) -> Result<Shadowed, ArrayError> {
        let ab = self
            .tree()
            .lookup(root, block_index)?
            .ok_or(ArrayError::NotFound {
                index: block_index * self.max_entries() as u64,
            })?;
        let (root, _) = self.tree().insert(root, block_index, ab)?;

        let (id, shared) = self.tm().shadow(ab)?;
        let data = self.tm().read(id)?.to_vec();
        let h = format::read_header(id, &data, self.value_size())?;
        if shared {
            for i in 0..h.nr_entries {
                self.hooks().inc(format::value(&data, h.value_size, i), 1);
            }
        }

        let root = if id != ab {
            self.tree().insert(root, block_index, id)?.0
        } else {
            root
        };
        Ok(Shadowed {
            root,
            id,
            data,
            nr_entries: h.nr_entries,
        })
    }

    /// Appends `count` default values to a fresh array block.
    fn new_ablock(&self, count: usize, default: &[u8]) -> Result<BlockId, ArrayError> {
        let vsize = self.value_size();
        let mut data = vec![0u8; self.tm().payload_size()];
        format::init(&mut data, self.max_entries(), vsize);
        for i in 0..count {
            format::value_mut(&mut data, vsize, i).copy_from_slice(default);
        }
        self.hooks().inc(default, count as u64);
        format::set_nr_entries(&mut data, count);

        let id = self.tm().new_block()?;
        self.tm().write(id, data)?;
        Ok(id)
    }

    fn grow(
        &self,
        root: BlockId,
        old_size: u64,
        new_size: u64,
        default: &[u8],
    ) -> Result<BlockId, ArrayError> {
        let max = self.max_entries() as u64;
        let mut root = root;

        let (last_block, tail) = self.locate(old_size);
        if tail > 0 {
            let mut ab = self.shadow_ablock(root, last_block)?;
            let fill = (new_size - old_size).min(max - tail as u64) as usize;
            let vsize = self.value_size();
            for i in ab.nr_entries..ab.nr_entries + fill {
                format::value_mut(&mut ab.data, vsize, i).copy_from_slice(default);
            }
            self.hooks().inc(default, fill as u64);
            format::set_nr_entries(&mut ab.data, ab.nr_entries + fill);
            self.tm().write(ab.id, ab.data)?;
            root = ab.root;
        }

        for block_index in self.block_count(old_size)..self.block_count(new_size) {
            let count = (new_size - block_index * max).min(max) as usize;
            let ab = self.new_ablock(count, default)?;
            root = self.tree().insert(root, block_index, ab)?.0;
        }
        Ok(root)
    }

    fn shrink(&self, root: BlockId, old_size: u64, new_size: u64) -> Result<BlockId, ArrayError> {
        let keep_blocks = self.block_count(new_size);
        let mut root = self
            .tree()
            .remove_range(root, keep_blocks..self.block_count(old_size))?;

        let (last_block, tail) = self.locate(new_size);
        if tail > 0 {
            let mut ab = self.shadow_ablock(root, last_block)?;
            let vsize = self.value_size();
            for i in tail..ab.nr_entries {
                self.hooks().dec(format::value(&ab.data, vsize, i));
            }
            format::set_nr_entries(&mut ab.data, tail);
            self.tm().write(ab.id, ab.data)?;
            root = ab.root;
        }
        Ok(root)
    }
}

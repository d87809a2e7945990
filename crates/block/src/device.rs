//! Raw block devices.
//!
//! A device stores whole framed blocks and knows nothing about reference
//! counts or transactions.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{BlockError, BlockId};

/// Fixed-size block storage.
pub trait Device: Send {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Reads block `id` into `buf` (`block_size` bytes).
    ///
    /// Returns [`BlockError::UnknownBlock`] if the block was never written.
    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf` (`block_size` bytes) as block `id`.
    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<(), BlockError>;

    /// Makes every completed write durable.
    fn sync(&mut self) -> Result<(), BlockError>;
}

/// A device that keeps every block in memory.
#[derive(Debug)]
pub struct MemDevice {
    block_size: usize,
    blocks: HashMap<BlockId, Box<[u8]>>,
}

impl MemDevice {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
        }
    }

    /// Number of blocks ever written.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Device for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<(), BlockError> {
        let block = self.blocks.get(&id).ok_or(BlockError::UnknownBlock(id))?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<(), BlockError> {
        self.blocks.insert(id, buf.into());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BlockError> {
        Ok(())
    }
}

/// A device backed by a single file, block `id` at byte `id * block_size`.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    block_size: usize,
}

impl FileDevice {
    /// Creates (or truncates) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self, BlockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, block_size })
    }

    /// Opens an existing file without touching its contents.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self, BlockError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, block_size })
    }

    fn offset(&self, id: BlockId) -> u64 {
        id * self.block_size as u64
    }
}

impl Device for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<(), BlockError> {
        let offset = self.offset(id);
        if offset + self.block_size as u64 > self.file.metadata()?.len() {
            return Err(BlockError::UnknownBlock(id));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<(), BlockError> {
        let offset = self.offset(id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BlockError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

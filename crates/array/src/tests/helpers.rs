use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{ArrayError, ArrayInfo, BlockId, PlainValue, TransactionManager, ValueType};

/// Values per array block for 4-byte values in 512-byte blocks.
pub const U32_PER_BLOCK: u64 = 121;

pub fn tm(capacity: u64) -> Arc<TransactionManager> {
    Arc::new(TransactionManager::in_memory(512, capacity))
}

pub fn u32_info(tm: &Arc<TransactionManager>) -> ArrayInfo {
    ArrayInfo::new(Arc::clone(tm), Arc::new(PlainValue::new(4))).unwrap()
}

pub fn le32(v: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    buf
}

pub fn get_u32(info: &ArrayInfo, root: BlockId, index: u64) -> Result<u32, ArrayError> {
    Ok(LittleEndian::read_u32(&info.get_value(root, index)?))
}

/// All values in index order, via `walk`.
pub fn values(info: &ArrayInfo, root: BlockId) -> Result<Vec<u32>, ArrayError> {
    let mut out = Vec::new();
    info.walk(root, |index, v| {
        assert_eq!(index, out.len() as u64);
        out.push(LittleEndian::read_u32(v));
        Ok(())
    })?;
    Ok(out)
}

/// Array of `size` values where value == index.
pub fn identity(info: &ArrayInfo, size: u64) -> Result<BlockId, ArrayError> {
    info.new_populated(size, |i, out| {
        LittleEndian::write_u32(out, i as u32);
        Ok(())
    })
}

#[derive(Default)]
pub struct Counts {
    pub inc_calls: usize,
    pub dec_calls: usize,
    pub net: HashMap<u32, i64>,
}

/// A 4-byte value type recording every hook call.
#[derive(Default)]
pub struct CountingValue {
    pub counts: Mutex<Counts>,
    pub compare: bool,
}

impl CountingValue {
    pub fn comparing() -> Self {
        Self {
            compare: true,
            ..Self::default()
        }
    }

    pub fn net(&self, v: u32) -> i64 {
        self.counts.lock().net.get(&v).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> (usize, usize) {
        let c = self.counts.lock();
        (c.inc_calls, c.dec_calls)
    }

    pub fn reset(&self) {
        *self.counts.lock() = Counts::default();
    }
}

impl ValueType for CountingValue {
    fn size(&self) -> usize {
        4
    }

    fn inc(&self, value: &[u8]) {
        let mut c = self.counts.lock();
        c.inc_calls += 1;
        *c.net.entry(LittleEndian::read_u32(value)).or_default() += 1;
    }

    fn dec(&self, value: &[u8]) {
        let mut c = self.counts.lock();
        c.dec_calls += 1;
        *c.net.entry(LittleEndian::read_u32(value)).or_default() -= 1;
    }

    fn equal(&self, old: &[u8], new: &[u8]) -> bool {
        self.compare && old == new
    }
}

pub fn counting_info(tm: &Arc<TransactionManager>, vt: &Arc<CountingValue>) -> ArrayInfo {
    ArrayInfo::new(Arc::clone(tm), vt.clone()).unwrap()
}

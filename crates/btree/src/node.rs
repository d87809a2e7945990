//! B-tree node block layout.
//!
//! ```text
//! [magic: u32 LE][kind: u32 LE][nr_entries: u32 LE][max_entries: u32 LE]
//! [keys:   max_entries x u64 LE]
//! [values: max_entries x u64 LE]
//! ```
//!
//! Internal nodes store the lowest key reachable through each child and the
//! child block id as value. Leaves store caller values.

use block::{BlockError, BlockId};
use byteorder::{ByteOrder, LittleEndian};

/// Magic number identifying B-tree nodes (ASCII "BTND").
pub const NODE_MAGIC: u32 = 0x4254_4E44;

/// Size of the node header in bytes: 4 x `u32`.
pub const NODE_HEADER_BYTES: usize = 4 * 4;

const ENTRY_BYTES: usize = 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Internal,
    Leaf,
}

impl NodeKind {
    fn tag(self) -> u32 {
        match self {
            NodeKind::Internal => 1,
            NodeKind::Leaf => 2,
        }
    }
}

/// Number of entries a node fits in a block payload of `payload_size` bytes.
pub fn max_entries(payload_size: usize) -> usize {
    payload_size.saturating_sub(NODE_HEADER_BYTES) / ENTRY_BYTES
}

/// Validated header of a node block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub kind: NodeKind,
    pub nr_entries: usize,
    pub max_entries: usize,
}

fn corrupt(block: BlockId, reason: String) -> BlockError {
    BlockError::Corrupt { block, reason }
}

pub(crate) fn read_header(block: BlockId, buf: &[u8]) -> Result<Header, BlockError> {
    if buf.len() < NODE_HEADER_BYTES {
        return Err(corrupt(block, "too small for a node header".into()));
    }

    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != NODE_MAGIC {
        return Err(corrupt(block, format!("bad node magic {:#010x}", magic)));
    }
    let kind = match LittleEndian::read_u32(&buf[4..8]) {
        1 => NodeKind::Internal,
        2 => NodeKind::Leaf,
        other => return Err(corrupt(block, format!("unknown node kind {}", other))),
    };
    let nr_entries = LittleEndian::read_u32(&buf[8..12]) as usize;
    let max_entries = LittleEndian::read_u32(&buf[12..16]) as usize;

    if nr_entries > max_entries || NODE_HEADER_BYTES + max_entries * ENTRY_BYTES > buf.len() {
        return Err(corrupt(
            block,
            format!("{} of {} entries do not fit", nr_entries, max_entries),
        ));
    }

    Ok(Header {
        kind,
        nr_entries,
        max_entries,
    })
}

pub(crate) fn key_at(buf: &[u8], i: usize) -> u64 {
    let off = NODE_HEADER_BYTES + i * 8;
    LittleEndian::read_u64(&buf[off..off + 8])
}

pub(crate) fn value_at(buf: &[u8], max_entries: usize, i: usize) -> u64 {
    let off = NODE_HEADER_BYTES + max_entries * 8 + i * 8;
    LittleEndian::read_u64(&buf[off..off + 8])
}

/// An owned, decoded node, used on the write paths.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub kind: NodeKind,
    pub keys: Vec<u64>,
    pub values: Vec<u64>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn decode(block: BlockId, buf: &[u8]) -> Result<Self, BlockError> {
        let h = read_header(block, buf)?;
        Ok(Self {
            kind: h.kind,
            keys: (0..h.nr_entries).map(|i| key_at(buf, i)).collect(),
            values: (0..h.nr_entries)
                .map(|i| value_at(buf, h.max_entries, i))
                .collect(),
        })
    }

    pub fn encode(&self, payload_size: usize) -> Vec<u8> {
        let max = max_entries(payload_size);
        debug_assert!(self.keys.len() <= max);

        let mut buf = vec![0u8; payload_size];
        LittleEndian::write_u32(&mut buf[0..4], NODE_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.kind.tag());
        LittleEndian::write_u32(&mut buf[8..12], self.keys.len() as u32);
        LittleEndian::write_u32(&mut buf[12..16], max as u32);

        let values_at = NODE_HEADER_BYTES + max * 8;
        for (i, (k, v)) in self.keys.iter().zip(&self.values).enumerate() {
            let ko = NODE_HEADER_BYTES + i * 8;
            LittleEndian::write_u64(&mut buf[ko..ko + 8], *k);
            let vo = values_at + i * 8;
            LittleEndian::write_u64(&mut buf[vo..vo + 8], *v);
        }
        buf
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Index of the last entry whose key is `<= key`.
    pub fn lower_bound(&self, key: u64) -> Option<usize> {
        match self.keys.binary_search(&key) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    pub fn insert_at(&mut self, i: usize, key: u64, value: u64) {
        self.keys.insert(i, key);
        self.values.insert(i, value);
    }

    pub fn remove_at(&mut self, i: usize) {
        self.keys.remove(i);
        self.values.remove(i);
    }

    /// Moves the upper half of the entries into a new node of the same kind.
    pub fn split_off(&mut self) -> Node {
        let mid = self.len() / 2;
        Node {
            kind: self.kind,
            keys: self.keys.split_off(mid),
            values: self.values.split_off(mid),
        }
    }
}

/// Binary search over the keys of a raw node block.
pub(crate) fn search(buf: &[u8], nr_entries: usize, key: u64) -> Result<usize, usize> {
    let (mut lo, mut hi) = (0, nr_entries);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match key_at(buf, mid).cmp(&key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Equal => return Ok(mid),
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Err(lo)
}

//! # BTree - Copy-on-Write B-Tree
//!
//! An ordered map from `u64` keys to `u64` values stored in blocks of a
//! [`TransactionManager`]. Every update shadows the nodes along its path and
//! returns a new root; blocks reachable from older roots are never written.
//!
//! Leaf values may themselves be references to other blocks. The tree tells
//! a [`ValueRefs`] implementation whenever it copies or drops a leaf value so
//! those references stay counted.
//!
//! ## Layout
//!
//! See the [`node`] module for the block layout. Internal nodes hold the
//! lowest key of each child; lookups follow the last child whose key is
//! `<=` the search key.
//!
//! Removal does not rebalance. Nodes that become empty are released and a
//! root left with a single child collapses into it.

mod cursor;
pub mod node;

pub use block::{BlockError, BlockId, TransactionManager};
pub use cursor::BTreeCursor;

use std::mem;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace};

use node::{Node, NodeKind};

/// Reference-count hooks for leaf values.
pub trait ValueRefs: Send + Sync {
    /// Called when a leaf value gains an owner (its node was copied).
    fn inc(&self, value: u64) -> Result<(), BlockError>;

    /// Called when a leaf value is dropped from the tree.
    fn dec(&self, value: u64) -> Result<(), BlockError>;
}

/// Leaf values that are plain integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefs;

impl ValueRefs for NoRefs {
    fn inc(&self, _value: u64) -> Result<(), BlockError> {
        Ok(())
    }

    fn dec(&self, _value: u64) -> Result<(), BlockError> {
        Ok(())
    }
}

/// Describes one kind of tree: where its blocks live and what its values are.
///
/// Holds no per-tree state; the same `BTree` serves any number of roots.
#[derive(Clone)]
pub struct BTree {
    tm: Arc<TransactionManager>,
    refs: Arc<dyn ValueRefs>,
}

impl BTree {
    pub fn new(tm: Arc<TransactionManager>, refs: Arc<dyn ValueRefs>) -> Self {
        Self { tm, refs }
    }

    /// A tree whose values need no reference counting.
    pub fn plain(tm: Arc<TransactionManager>) -> Self {
        Self::new(tm, Arc::new(NoRefs))
    }

    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    /// Entries per node.
    pub fn max_entries(&self) -> usize {
        node::max_entries(self.tm.payload_size())
    }

    /// Creates an empty tree.
    pub fn empty(&self) -> Result<BlockId, BlockError> {
        self.new_node(&Node::new(NodeKind::Leaf))
    }

    /// Looks up `key`.
    pub fn lookup(&self, root: BlockId, key: u64) -> Result<Option<u64>, BlockError> {
        let mut id = root;
        loop {
            let block = self.tm.read(id)?;
            let h = node::read_header(id, &block)?;
            let found = node::search(&block, h.nr_entries, key);

            match h.kind {
                NodeKind::Leaf => {
                    return Ok(found.ok().map(|i| node::value_at(&block, h.max_entries, i)));
                }
                NodeKind::Internal => {
                    let i = match found {
                        Ok(i) => i,
                        Err(0) => return Ok(None),
                        Err(i) => i - 1,
                    };
                    id = node::value_at(&block, h.max_entries, i);
                }
            }
        }
    }

    /// Inserts or replaces `key`.
    ///
    /// Returns the new root and the value that was replaced, if any. The
    /// replaced value is *not* passed to [`ValueRefs::dec`]; the caller owns
    /// the reference the tree used to hold.
    pub fn insert(
        &self,
        root: BlockId,
        key: u64,
        value: u64,
    ) -> Result<(BlockId, Option<u64>), BlockError> {
        let max = self.max_entries();
        let (root, mut n) = self.shadow_node(root)?;

        if n.len() >= max {
            let right = n.split_off();
            let left_id = self.new_node(&n)?;
            let right_id = self.new_node(&right)?;

            let mut top = Node::new(NodeKind::Internal);
            top.insert_at(0, n.keys[0], left_id);
            top.insert_at(1, right.keys[0], right_id);
            self.write_node(root, &top)?;
            n = top;
            debug!(root, left_id, right_id, "split btree root");
        }

        let mut id = root;
        loop {
            if n.is_leaf() {
                let old = match n.keys.binary_search(&key) {
                    Ok(i) => Some(mem::replace(&mut n.values[i], value)),
                    Err(i) => {
                        n.insert_at(i, key, value);
                        None
                    }
                };
                self.write_node(id, &n)?;
                return Ok((root, old));
            }

            if n.is_empty() {
                return Err(BlockError::Corrupt {
                    block: id,
                    reason: "empty internal node".into(),
                });
            }
            let i = match n.lower_bound(key) {
                Some(i) => i,
                None => {
                    n.keys[0] = key;
                    0
                }
            };

            let (child_id, mut child) = self.shadow_node(n.values[i])?;
            n.values[i] = child_id;

            if child.len() >= max {
                let right = child.split_off();
                let right_key = right.keys[0];
                let right_id = self.new_node(&right)?;
                self.write_node(child_id, &child)?;
                n.insert_at(i + 1, right_key, right_id);
                self.write_node(id, &n)?;
                trace!(parent = id, child_id, right_id, "split btree node");

                (id, n) = if key >= right_key {
                    (right_id, right)
                } else {
                    (child_id, child)
                };
            } else {
                self.write_node(id, &n)?;
                (id, n) = (child_id, child);
            }
        }
    }

    /// Removes `key`, returning the new root and the removed value.
    ///
    /// As with [`insert`](Self::insert), the removed value's reference passes
    /// to the caller.
    pub fn remove(&self, root: BlockId, key: u64) -> Result<(BlockId, Option<u64>), BlockError> {
        let mut taken = Vec::new();
        let end = key.checked_add(1).unwrap_or(u64::MAX);
        let root = self.prune_root(root, &(key..end), Some(&mut taken))?;
        Ok((root, taken.pop()))
    }

    /// Removes every key in `range`, dropping their values.
    pub fn remove_range(&self, root: BlockId, range: Range<u64>) -> Result<BlockId, BlockError> {
        if range.is_empty() {
            return Ok(root);
        }
        self.prune_root(root, &range, None)
    }

    /// Visits every entry in key order.
    pub fn walk<E, F>(&self, root: BlockId, mut f: F) -> Result<(), E>
    where
        E: From<BlockError>,
        F: FnMut(u64, u64) -> Result<(), E>,
    {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let n = self.read_node(id)?;
            if n.is_leaf() {
                for (&k, &v) in n.keys.iter().zip(&n.values) {
                    f(k, v)?;
                }
            } else {
                stack.extend(n.values.iter().rev());
            }
        }
        Ok(())
    }

    /// Drops the caller's reference to the tree at `root`.
    ///
    /// Sub-trees still shared with other roots are only decremented.
    pub fn del(&self, root: BlockId) -> Result<(), BlockError> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.tm.ref_count(id) > 1 {
                self.tm.dec(id)?;
                continue;
            }

            let n = self.read_node(id)?;
            if n.is_leaf() {
                for &v in &n.values {
                    self.refs.dec(v)?;
                }
            } else {
                stack.extend_from_slice(&n.values);
            }
            self.tm.dec(id)?;
        }
        Ok(())
    }

    /// Number of levels, 1 for a single leaf.
    pub fn height(&self, root: BlockId) -> Result<usize, BlockError> {
        let mut id = root;
        let mut height = 1;
        loop {
            let block = self.tm.read(id)?;
            let h = node::read_header(id, &block)?;
            if h.kind == NodeKind::Leaf || h.nr_entries == 0 {
                return Ok(height);
            }
            id = node::value_at(&block, h.max_entries, 0);
            height += 1;
        }
    }

    // ---- Internal helpers ----

    fn read_node(&self, id: BlockId) -> Result<Node, BlockError> {
        let block = self.tm.read(id)?;
        Node::decode(id, &block)
    }

    fn write_node(&self, id: BlockId, n: &Node) -> Result<(), BlockError> {
        self.tm.write(id, n.encode(self.tm.payload_size()))
    }

    fn new_node(&self, n: &Node) -> Result<BlockId, BlockError> {
        let id = self.tm.new_block()?;
        self.write_node(id, n)?;
        Ok(id)
    }

    /// Shadows `id`. A copy of a shared node takes its own reference to
    /// everything the node points at.
    fn shadow_node(&self, id: BlockId) -> Result<(BlockId, Node), BlockError> {
        let (id, shared) = self.tm.shadow(id)?;
        let n = self.read_node(id)?;
        if shared {
            if n.is_leaf() {
                for &v in &n.values {
                    self.refs.inc(v)?;
                }
            } else {
                for &child in &n.values {
                    self.tm.inc(child)?;
                }
            }
        }
        Ok((id, n))
    }

    fn prune_root(
        &self,
        root: BlockId,
        range: &Range<u64>,
        taken: Option<&mut Vec<u64>>,
    ) -> Result<BlockId, BlockError> {
        let mut root = match self.prune(root, range, taken)? {
            Some(root) => root,
            None => return self.empty(),
        };

        loop {
            let n = self.read_node(root)?;
            if n.is_leaf() || n.len() != 1 {
                return Ok(root);
            }
            let child = n.values[0];
            self.tm.dec(root)?;
            trace!(root, child, "collapsed btree root");
            root = child;
        }
    }

    /// Removes the keys in `range` below `id`. Values go to `taken` when
    /// given, to [`ValueRefs::dec`] otherwise.
    ///
    /// Returns `None` when the node was emptied and released.
    fn prune(
        &self,
        id: BlockId,
        range: &Range<u64>,
        mut taken: Option<&mut Vec<u64>>,
    ) -> Result<Option<BlockId>, BlockError> {
        let (id, mut n) = self.shadow_node(id)?;
        let before = n.len();

        if n.is_leaf() {
            let lo = n.keys.partition_point(|&k| k < range.start);
            let hi = n.keys.partition_point(|&k| k < range.end);
            n.keys.drain(lo..hi);
            for v in n.values.drain(lo..hi) {
                match taken.as_deref_mut() {
                    Some(out) => out.push(v),
                    None => self.refs.dec(v)?,
                }
            }
        } else {
            let mut i = 0;
            while i < n.len() && n.keys[i] < range.end {
                let next_key = n.keys.get(i + 1).copied();
                if next_key.map_or(false, |k| k <= range.start) {
                    i += 1;
                    continue;
                }

                let covered = taken.is_none()
                    && range.start <= n.keys[i]
                    && next_key.map_or(false, |k| k <= range.end);
                if covered {
                    self.del(n.values[i])?;
                    n.remove_at(i);
                    continue;
                }

                match self.prune(n.values[i], range, taken.as_deref_mut())? {
                    Some(child) => {
                        n.values[i] = child;
                        i += 1;
                    }
                    None => n.remove_at(i),
                }
            }
        }

        if n.is_empty() && n.len() < before {
            self.tm.dec(id)?;
            return Ok(None);
        }
        self.write_node(id, &n)?;
        Ok(Some(id))
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("max_entries", &self.max_entries())
            .finish()
    }
}

use std::sync::Arc;

use block::{BlockError, BlockId, BlockRef, TransactionManager};

use crate::node::{self, Header, NodeKind};
use crate::BTree;

struct Frame {
    block: BlockRef,
    header: Header,
    index: usize,
}

/// Forward iteration over the entries of one tree root.
///
/// The cursor pins the current leaf and every node on the path to it, so
/// moving to the next leaf is a step up and down rather than a lookup from
/// the root. Pins are released as the cursor leaves each node and when it is
/// dropped.
pub struct BTreeCursor {
    tm: Arc<TransactionManager>,
    path: Vec<Frame>,
}

impl BTreeCursor {
    /// Positions a cursor on the first entry of `root`.
    ///
    /// On an empty tree the cursor is created exhausted; check
    /// [`valid`](Self::valid).
    pub fn begin(tree: &BTree, root: BlockId) -> Result<Self, BlockError> {
        let mut cursor = Self {
            tm: Arc::clone(tree.tm()),
            path: Vec::new(),
        };
        cursor.descend(root)?;
        Ok(cursor)
    }

    /// `true` while the cursor is positioned on an entry.
    pub fn valid(&self) -> bool {
        !self.path.is_empty()
    }

    /// The current `(key, value)`.
    pub fn get(&self) -> Option<(u64, u64)> {
        let leaf = self.path.last()?;
        Some((
            node::key_at(&leaf.block, leaf.index),
            node::value_at(&leaf.block, leaf.header.max_entries, leaf.index),
        ))
    }

    /// Moves to the next entry. Returns `false` once the end is reached.
    pub fn next(&mut self) -> Result<bool, BlockError> {
        self.skip(1)
    }

    /// Moves forward `count` entries, jumping directly within a leaf.
    pub fn skip(&mut self, mut count: u64) -> Result<bool, BlockError> {
        loop {
            let Some(leaf) = self.path.last_mut() else {
                return Ok(false);
            };

            let left_in_leaf = (leaf.header.nr_entries - 1 - leaf.index) as u64;
            if count <= left_in_leaf {
                leaf.index += count as usize;
                return Ok(true);
            }
            count -= left_in_leaf + 1;

            if !self.next_leaf()? {
                return Ok(false);
            }
        }
    }

    /// Releases every pin held by the cursor.
    pub fn end(self) {}

    /// Pushes the leftmost path below `id`. Returns `false` if it ends in an
    /// empty leaf, which is not pushed.
    fn descend(&mut self, mut id: BlockId) -> Result<bool, BlockError> {
        loop {
            let block = self.tm.read(id)?;
            let header = node::read_header(id, &block)?;
            if header.nr_entries == 0 {
                return match header.kind {
                    NodeKind::Leaf => Ok(false),
                    NodeKind::Internal => Err(BlockError::Corrupt {
                        block: id,
                        reason: "empty internal node".into(),
                    }),
                };
            }

            let child = match header.kind {
                NodeKind::Internal => Some(node::value_at(&block, header.max_entries, 0)),
                NodeKind::Leaf => None,
            };
            self.path.push(Frame {
                block,
                header,
                index: 0,
            });
            match child {
                Some(child) => id = child,
                None => return Ok(true),
            }
        }
    }

    /// Leaves the current leaf and positions on the first entry of the next.
    fn next_leaf(&mut self) -> Result<bool, BlockError> {
        self.path.pop();
        while let Some(parent) = self.path.last_mut() {
            parent.index += 1;
            if parent.index < parent.header.nr_entries {
                let child = node::value_at(&parent.block, parent.header.max_entries, parent.index);
                if self.descend(child)? {
                    return Ok(true);
                }
            } else {
                self.path.pop();
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for BTreeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeCursor")
            .field("depth", &self.path.len())
            .field("entry", &self.get())
            .finish()
    }
}

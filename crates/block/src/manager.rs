//! The transaction manager: allocation, reference counting, shadowing and
//! commit/abort over a [`Device`].

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use config::StoreConfig;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace};

use crate::device::{Device, FileDevice, MemDevice};
use crate::frame::{self, FRAME_HEADER_BYTES};
use crate::{BlockError, BlockId};

/// Counts live [`BlockRef`]s. Dropping the guard releases the pin.
struct Pin(Arc<AtomicUsize>);

impl Pin {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A pinned, read-only view of a block payload.
///
/// The view is a snapshot: later writes to the same block id are not visible
/// through it. The pin is released when the `BlockRef` is dropped.
pub struct BlockRef {
    id: BlockId,
    data: Arc<Vec<u8>>,
    _pin: Pin,
}

impl BlockRef {
    /// The block this view was read from.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }
}

impl Deref for BlockRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Allocator state as of the last commit, restored by `abort`.
#[derive(Clone, Default)]
struct Checkpoint {
    refs: HashMap<BlockId, u32>,
    free: Vec<BlockId>,
    next_block: BlockId,
}

/// One change recorded while a [`Savepoint`] is open.
#[derive(Debug)]
enum Undo {
    /// Block handed out by `alloc`, from the free list or the high-water mark.
    Alloc { id: BlockId, recycled: bool },
    Inc(BlockId),
    Dec(BlockId),
    /// Payload replaced by `write`.
    Write {
        id: BlockId,
        prior: Option<Arc<Vec<u8>>>,
        was_dirty: bool,
    },
}

struct State {
    device: Box<dyn Device>,
    /// Payloads read or written during the current transaction.
    cache: HashMap<BlockId, Arc<Vec<u8>>>,
    dirty: HashSet<BlockId>,
    refs: HashMap<BlockId, u32>,
    /// Blocks allocated in this transaction; the only writable ones.
    shadows: HashSet<BlockId>,
    /// Blocks whose count reached zero in this transaction.
    freed: HashSet<BlockId>,
    free: Vec<BlockId>,
    next_block: BlockId,
    checkpoint: Checkpoint,
    /// Open savepoints; changes are only logged while this is non-zero.
    savepoints: usize,
    undo: Vec<Undo>,
}

impl State {
    fn log(&mut self, undo: Undo) {
        if self.savepoints > 0 {
            self.undo.push(undo);
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Alloc { id, recycled } => {
                self.refs.remove(&id);
                self.shadows.remove(&id);
                self.freed.remove(&id);
                self.cache.remove(&id);
                self.dirty.remove(&id);
                if recycled {
                    self.free.push(id);
                } else {
                    self.next_block -= 1;
                }
            }
            Undo::Inc(id) => {
                if let Some(count) = self.refs.get_mut(&id) {
                    *count -= 1;
                }
            }
            Undo::Dec(id) => {
                if self.freed.remove(&id) {
                    self.refs.insert(id, 1);
                } else if let Some(count) = self.refs.get_mut(&id) {
                    *count += 1;
                }
            }
            Undo::Write {
                id,
                prior,
                was_dirty,
            } => {
                match prior {
                    Some(data) => self.cache.insert(id, data),
                    None => self.cache.remove(&id),
                };
                if !was_dirty {
                    self.dirty.remove(&id);
                }
            }
        }
    }
}

/// Scope of a multi-step update that must succeed or fail as a whole.
///
/// Every change made through the manager while a savepoint is open is
/// recorded. [`release`](Self::release) keeps the changes;
/// [`rollback`](Self::rollback), or dropping the savepoint, undoes them,
/// restoring reference counts, allocations and block contents.
///
/// Savepoints nest. An open savepoint also excludes other threads from
/// opening one, so updates running under savepoints never interleave.
/// Commit and abort wait until no savepoint is open on another thread and
/// must not be called from inside one.
#[must_use = "dropping a savepoint rolls it back"]
pub struct Savepoint<'a> {
    tm: &'a TransactionManager,
    mark: usize,
    done: bool,
    _writer: ReentrantMutexGuard<'a, ()>,
}

impl Savepoint<'_> {
    /// Keeps every change made since the savepoint was opened.
    pub fn release(mut self) {
        self.finish(true);
    }

    /// Undoes every change made since the savepoint was opened.
    pub fn rollback(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, keep: bool) {
        self.done = true;
        let mut state = self.tm.state.lock();
        if !keep {
            while state.undo.len() > self.mark {
                if let Some(undo) = state.undo.pop() {
                    state.revert(undo);
                }
            }
            trace!(mark = self.mark, "rolled back savepoint");
        }
        state.savepoints -= 1;
        if state.savepoints == 0 {
            state.undo.clear();
        }
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.finish(false);
        }
    }
}

/// Supervises every block of one device.
///
/// All methods take `&self`; the mutable state sits behind a mutex so that a
/// manager can be shared as `Arc<TransactionManager>` by any number of array
/// and bitset handles. Callers still serialize the root-producing calls of
/// each individual structure.
pub struct TransactionManager {
    state: Mutex<State>,
    block_size: usize,
    capacity: u64,
    sync_on_commit: bool,
    pins: Arc<AtomicUsize>,
    writer: ReentrantMutex<()>,
}

impl TransactionManager {
    /// Creates a manager over `device` with room for `capacity` blocks.
    pub fn new(device: Box<dyn Device>, capacity: u64, sync_on_commit: bool) -> Self {
        let block_size = device.block_size();
        Self {
            state: Mutex::new(State {
                device,
                cache: HashMap::new(),
                dirty: HashSet::new(),
                refs: HashMap::new(),
                shadows: HashSet::new(),
                freed: HashSet::new(),
                free: Vec::new(),
                next_block: 0,
                checkpoint: Checkpoint::default(),
                savepoints: 0,
                undo: Vec::new(),
            }),
            block_size,
            capacity,
            sync_on_commit,
            pins: Arc::new(AtomicUsize::new(0)),
            writer: ReentrantMutex::new(()),
        }
    }

    /// Opens the store described by `config`: a fresh [`FileDevice`] when a
    /// path is set, a [`MemDevice`] otherwise.
    pub fn open(config: &StoreConfig) -> Result<Self, BlockError> {
        config.validate()?;

        let device: Box<dyn Device> = match &config.path {
            Some(path) => Box::new(FileDevice::create(path, config.block_size)?),
            None => Box::new(MemDevice::new(config.block_size)),
        };
        debug!(
            block_size = config.block_size,
            nr_blocks = config.nr_blocks,
            file_backed = config.path.is_some(),
            "opening block store"
        );
        Ok(Self::new(device, config.nr_blocks, config.sync_on_commit))
    }

    /// An in-memory store, mostly useful in tests.
    pub fn in_memory(block_size: usize, capacity: u64) -> Self {
        Self::new(Box::new(MemDevice::new(block_size)), capacity, false)
    }

    /// Size of a block on the device, framing included.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes of every block available to the layers above.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.block_size - FRAME_HEADER_BYTES
    }

    /// Maximum number of blocks the device can hold.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of [`BlockRef`]s currently alive.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.pins.load(Ordering::Relaxed)
    }

    /// Number of blocks with a non-zero reference count.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.state.lock().refs.len()
    }

    /// Allocates a zeroed, writable block with a reference count of one.
    pub fn new_block(&self) -> Result<BlockId, BlockError> {
        let mut state = self.state.lock();
        let id = self.alloc(&mut state)?;
        state
            .cache
            .insert(id, Arc::new(vec![0u8; self.payload_size()]));
        state.dirty.insert(id);
        Ok(id)
    }

    /// Reads and pins block `id`.
    pub fn read(&self, id: BlockId) -> Result<BlockRef, BlockError> {
        let mut state = self.state.lock();
        let data = self.load(&mut state, id)?;
        Ok(BlockRef {
            id,
            data,
            _pin: Pin::new(&self.pins),
        })
    }

    /// Replaces the payload of a block owned by the current transaction.
    ///
    /// # Errors
    ///
    /// [`BlockError::ReadOnly`] if the block was not allocated or shadowed in
    /// this transaction, [`BlockError::Size`] if `payload` has the wrong length.
    pub fn write(&self, id: BlockId, payload: Vec<u8>) -> Result<(), BlockError> {
        if payload.len() != self.payload_size() {
            return Err(BlockError::Size {
                got: payload.len(),
                want: self.payload_size(),
            });
        }

        let mut state = self.state.lock();
        if !state.shadows.contains(&id) || !state.refs.contains_key(&id) {
            return Err(BlockError::ReadOnly(id));
        }
        let prior = state.cache.insert(id, Arc::new(payload));
        let was_dirty = !state.dirty.insert(id);
        state.log(Undo::Write {
            id,
            prior,
            was_dirty,
        });
        Ok(())
    }

    /// Returns a writable version of block `id`.
    ///
    /// A block created in this transaction with a single owner is returned
    /// as is. Otherwise a copy is allocated and one reference to the original
    /// is dropped. The flag is `true` when the original is still referenced
    /// elsewhere; the caller must then take new references for everything
    /// the copied contents point at.
    pub fn shadow(&self, id: BlockId) -> Result<(BlockId, bool), BlockError> {
        let mut state = self.state.lock();
        let count = *state.refs.get(&id).ok_or(BlockError::UnknownBlock(id))?;

        if count == 1 && state.shadows.contains(&id) {
            return Ok((id, false));
        }

        let data = self.load(&mut state, id)?;
        let copy = self.alloc(&mut state)?;
        state.cache.insert(copy, Arc::new(data.to_vec()));
        state.dirty.insert(copy);
        Self::release(&mut state, id);

        trace!(from = id, to = copy, shared = count > 1, "shadowed block");
        Ok((copy, count > 1))
    }

    /// Takes an extra reference to block `id`.
    pub fn inc(&self, id: BlockId) -> Result<(), BlockError> {
        let mut state = self.state.lock();
        let count = state.refs.get_mut(&id).ok_or(BlockError::UnknownBlock(id))?;
        *count += 1;
        state.log(Undo::Inc(id));
        Ok(())
    }

    /// Drops a reference to block `id`. At zero the block stays readable
    /// until the next commit, then it is recycled.
    pub fn dec(&self, id: BlockId) -> Result<(), BlockError> {
        let mut state = self.state.lock();
        if !state.refs.contains_key(&id) {
            return Err(BlockError::UnknownBlock(id));
        }
        Self::release(&mut state, id);
        Ok(())
    }

    /// Current reference count of block `id` (zero if unallocated).
    #[must_use]
    pub fn ref_count(&self, id: BlockId) -> u32 {
        self.state.lock().refs.get(&id).copied().unwrap_or(0)
    }

    /// Opens a [`Savepoint`], waiting while another thread holds one.
    pub fn savepoint(&self) -> Savepoint<'_> {
        let writer = self.writer.lock();
        let mut state = self.state.lock();
        state.savepoints += 1;
        let mark = state.undo.len();
        drop(state);

        Savepoint {
            tm: self,
            mark,
            done: false,
            _writer: writer,
        }
    }

    /// Writes every dirty block to the device and starts a new transaction.
    ///
    /// Blocks released during the transaction become available for
    /// allocation afterwards; roots that depended on them are gone.
    pub fn commit(&self) -> Result<(), BlockError> {
        let _writer = self.writer.lock();
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut raw = vec![0u8; self.block_size];
        let mut written = 0usize;
        for &id in &state.dirty {
            if !state.refs.contains_key(&id) {
                continue;
            }
            let payload = state.cache.get(&id).ok_or(BlockError::UnknownBlock(id))?;
            frame::encode(id, payload, &mut raw);
            state.device.write_block(id, &raw)?;
            written += 1;
        }
        if self.sync_on_commit {
            state.device.sync()?;
        }

        let recycled = state.freed.len();
        state.free.extend(state.freed.drain());
        state.dirty.clear();
        state.shadows.clear();
        state.cache.clear();
        state.undo.clear();
        state.checkpoint = Checkpoint {
            refs: state.refs.clone(),
            free: state.free.clone(),
            next_block: state.next_block,
        };

        debug!(written, recycled, live = state.refs.len(), "committed transaction");
        Ok(())
    }

    /// Discards every change made since the last commit.
    pub fn abort(&self) {
        let _writer = self.writer.lock();
        let mut state = self.state.lock();
        let state = &mut *state;

        let discarded = state.shadows.len();
        let checkpoint = state.checkpoint.clone();
        state.refs = checkpoint.refs;
        state.free = checkpoint.free;
        state.next_block = checkpoint.next_block;
        state.dirty.clear();
        state.shadows.clear();
        state.freed.clear();
        state.cache.clear();
        state.undo.clear();

        debug!(discarded, "aborted transaction");
    }

    // ---- Internal helpers ----

    fn alloc(&self, state: &mut State) -> Result<BlockId, BlockError> {
        let (id, recycled) = match state.free.pop() {
            Some(id) => (id, true),
            None => {
                if state.next_block >= self.capacity {
                    debug!(capacity = self.capacity, "block allocation failed");
                    return Err(BlockError::NoSpace(self.capacity));
                }
                state.next_block += 1;
                (state.next_block - 1, false)
            }
        };
        state.refs.insert(id, 1);
        state.shadows.insert(id);
        state.log(Undo::Alloc { id, recycled });
        Ok(id)
    }

    fn release(state: &mut State, id: BlockId) {
        if let Some(count) = state.refs.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                state.refs.remove(&id);
                state.freed.insert(id);
            }
            state.log(Undo::Dec(id));
        }
    }

    fn load(&self, state: &mut State, id: BlockId) -> Result<Arc<Vec<u8>>, BlockError> {
        if let Some(data) = state.cache.get(&id) {
            return Ok(Arc::clone(data));
        }
        if !state.refs.contains_key(&id) && !state.freed.contains(&id) {
            return Err(BlockError::UnknownBlock(id));
        }

        let mut raw = vec![0u8; self.block_size];
        state.device.read_block(id, &mut raw)?;
        let data = Arc::new(frame::decode(id, &raw)?.to_vec());
        state.cache.insert(id, Arc::clone(&data));
        Ok(data)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionManager")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("live_blocks", &state.refs.len())
            .field("dirty_blocks", &state.dirty.len())
            .field("pinned", &self.pinned())
            .finish()
    }
}

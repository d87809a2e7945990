//! # Radix - In-Place MSD Radix Sort
//!
//! Sorts slices of references to fixed-length byte keys into ascending
//! lexicographic order. Only the slice of references is permuted; the key
//! bytes are never copied.
//!
//! ## Algorithm
//!
//! Each task covers a contiguous range of keys that already agree on every
//! byte before `offset`. The byte at `offset` is counted into a 256-entry
//! histogram, the range is partitioned in place into one pile per byte value
//! by following swap cycles, and every pile that still needs ordering becomes
//! a new task one byte further in. Large piles go on an explicit task stack,
//! small ones (at most [`INSERTION_SORT_THRESHOLD`] keys) are finished with an
//! insertion sort straight after the partition.
//!
//! The task stack is allocated once, at construction, with room for
//! `max_count / INSERTION_SORT_THRESHOLD` tasks. Every stacked task holds more
//! than the threshold number of keys and stacked tasks never overlap, so that
//! bound is never exceeded for `count <= max_count`. No recursion is used.
//!
//! The sort is **unstable**: equal keys may be reordered.
//!
//! ## Example
//!
//! ```rust
//! use radix::RadixSorter;
//!
//! let data = [*b"pear", *b"fig!", *b"kiwi"];
//! let mut keys: Vec<&[u8]> = data.iter().map(|k| &k[..]).collect();
//!
//! let mut sorter = RadixSorter::new(16).unwrap();
//! sorter.sort(&mut keys, 4).unwrap();
//! assert_eq!(keys, vec![&b"fig!"[..], &b"kiwi"[..], &b"pear"[..]]);
//! ```

use thiserror::Error;

/// Piles with at most this many keys are sorted by insertion sort.
pub const INSERTION_SORT_THRESHOLD: usize = 12;

/// Maximum number of small piles a single partition can produce.
const MAX_PILES: usize = 256;

/// Errors returned by [`RadixSorter`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SortError {
    /// The scratch area could not be allocated.
    #[error("out of memory allocating a sorter for {0} keys")]
    OutOfMemory(usize),

    /// The request does not fit the sorter or the keys.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The task stack overflowed. The key order is unspecified afterwards.
    #[error("radix sort task stack overflow")]
    BadState,
}

/// Counts of each byte value at the current offset.
///
/// `used` and `size` are left zeroed by every completed partition, so the
/// histogram only needs `first`/`last` reset before the next tally.
struct Histogram {
    /// Number of non-empty bins.
    used: u16,
    /// Lowest non-empty bin.
    first: usize,
    /// Highest non-empty bin.
    last: usize,
    size: [u32; 256],
}

impl Histogram {
    fn new() -> Self {
        Self {
            used: 0,
            first: 0,
            last: 0,
            size: [0; 256],
        }
    }

    fn clear(&mut self) {
        self.used = 0;
        self.first = 0;
        self.last = 0;
        self.size = [0; 256];
    }
}

/// A range of keys `first..=last` to be ordered from byte `offset` on,
/// comparing `length` bytes.
#[derive(Debug, Clone, Copy)]
struct Task {
    first: usize,
    last: usize,
    offset: usize,
    length: usize,
}

impl Task {
    fn new(first: usize, count: usize, offset: usize, length: usize) -> Self {
        Self {
            first,
            last: first + count - 1,
            offset,
            length,
        }
    }
}

/// A reusable radix sorter with a scratch area sized at construction.
///
/// A sorter is single-writer scratch space: `sort` takes `&mut self`, so
/// sharing one between threads requires a lock at the call site.
pub struct RadixSorter {
    /// Largest `count` accepted by [`sort`](RadixSorter::sort).
    max_count: usize,
    bins: Histogram,
    /// Exclusive end index of each pile during a partition.
    pile: [usize; 256],
    /// Small piles deferred to insertion sort after the current partition.
    insertion_list: Vec<Task>,
    /// Capacity is fixed at construction and never grows.
    stack: Vec<Task>,
    stack_size: usize,
}

impl RadixSorter {
    /// Creates a sorter able to sort up to `max_count` keys per call.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::OutOfMemory`] if the task stack cannot be
    /// allocated.
    pub fn new(max_count: usize) -> Result<Self, SortError> {
        let stack_size = max_count / INSERTION_SORT_THRESHOLD;

        let mut stack = Vec::new();
        stack
            .try_reserve_exact(stack_size)
            .map_err(|_| SortError::OutOfMemory(max_count))?;

        let mut insertion_list = Vec::new();
        insertion_list
            .try_reserve_exact(MAX_PILES)
            .map_err(|_| SortError::OutOfMemory(max_count))?;

        Ok(Self {
            max_count,
            bins: Histogram::new(),
            pile: [0; 256],
            insertion_list,
            stack,
            stack_size,
        })
    }

    /// Returns the largest key count this sorter accepts.
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Returns the number of task slots reserved at construction.
    #[must_use]
    pub fn stack_capacity(&self) -> usize {
        self.stack_size
    }

    /// Sorts `keys` by their first `length` bytes.
    ///
    /// Zero keys or zero-length keys are already sorted. Every key must be at
    /// least `length` bytes long; bytes past `length` are ignored.
    ///
    /// # Errors
    ///
    /// * [`SortError::InvalidArgument`] if `keys.len()` exceeds the
    ///   construction-time `max_count`, or a key is shorter than `length`.
    /// * [`SortError::BadState`] if the task stack overflows. The order of
    ///   `keys` is unspecified in that case.
    pub fn sort(&mut self, keys: &mut [&[u8]], length: usize) -> Result<(), SortError> {
        let count = keys.len();
        if count == 0 || length == 0 {
            return Ok(());
        }
        if count > self.max_count {
            return Err(SortError::InvalidArgument(format!(
                "{} keys exceed sorter capacity {}",
                count, self.max_count
            )));
        }
        if let Some(short) = keys.iter().position(|k| k.len() < length) {
            return Err(SortError::InvalidArgument(format!(
                "key {} has {} bytes, need {}",
                short,
                keys[short].len(),
                length
            )));
        }

        let start = Task::new(0, count, 0, length);
        if count <= INSERTION_SORT_THRESHOLD {
            insertion_sort(keys, start);
            return Ok(());
        }

        self.stack.clear();
        self.stack.push(start);

        while let Some(task) = self.stack.pop() {
            self.measure_bins(keys, task);

            self.insertion_list.clear();
            if let Err(e) = self.push_bins(task) {
                self.bins.clear();
                self.stack.clear();
                self.insertion_list.clear();
                return Err(e);
            }
            // bins.used is zero again.

            self.partition(keys, task);
            // bins.size is all zero again.

            for small in self.insertion_list.drain(..).rev() {
                insertion_sort(keys, small);
            }
        }

        Ok(())
    }

    /// Tallies the byte at `task.offset` of every key in the task.
    fn measure_bins(&mut self, keys: &[&[u8]], task: Task) {
        let bins = &mut self.bins;
        bins.first = u8::MAX as usize;
        bins.last = 0;

        for key in &keys[task.first..=task.last] {
            let bin = key[task.offset] as usize;
            bins.size[bin] += 1;

            if bins.size[bin] == 1 {
                bins.used += 1;
                bins.first = bins.first.min(bin);
                bins.last = bins.last.max(bin);
            }
        }
    }

    /// Turns bin sizes into pile end indices and queues a follow-up task for
    /// every pile that still needs ordering on the next byte.
    fn push_bins(&mut self, task: Task) -> Result<(), SortError> {
        let offset = task.offset + 1;
        let length = task.length - 1;
        let mut pile_start = task.first;

        for bin in self.bins.first..256 {
            let size = self.bins.size[bin] as usize;
            if size == 0 {
                continue;
            }

            // Keys that are exhausted need no further ordering.
            if length > 0 {
                if size > INSERTION_SORT_THRESHOLD {
                    if self.stack.len() >= self.stack_size {
                        return Err(SortError::BadState);
                    }
                    self.stack.push(Task::new(pile_start, size, offset, length));
                } else if size > 1 {
                    self.insertion_list
                        .push(Task::new(pile_start, size, offset, length));
                }
            }

            pile_start += size;
            self.pile[bin] = pile_start;
            self.bins.used -= 1;
            if self.bins.used == 0 {
                break;
            }
        }

        Ok(())
    }

    /// Moves every key into its pile by chasing swap cycles.
    ///
    /// The highest pile is never walked: once every lower pile is complete,
    /// whatever remains is already in place.
    fn partition(&mut self, keys: &mut [&[u8]], task: Task) {
        let bins = &mut self.bins;
        let pile = &mut self.pile;

        let stop = task.last + 1 - bins.size[bins.last] as usize;
        bins.size[bins.last] = 0;

        let mut fence = task.first;
        while fence < stop {
            let mut key = keys[fence];
            let mut bin;

            // Swap the key into the top free slot of its pile and carry on
            // with whichever key was displaced, until a pile reaches the fence.
            loop {
                bin = key[task.offset] as usize;
                pile[bin] -= 1;
                if pile[bin] <= fence {
                    break;
                }
                std::mem::swap(&mut keys[pile[bin]], &mut key);
            }

            // That pile is now complete; the fence moves past it.
            keys[fence] = key;
            fence += bins.size[bin] as usize;
            bins.size[bin] = 0;
        }
    }
}

impl std::fmt::Debug for RadixSorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixSorter")
            .field("max_count", &self.max_count)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Sorts `task.first..=task.last` by insertion, comparing
/// `key[offset..offset + length]`.
fn insertion_sort(keys: &mut [&[u8]], task: Task) {
    let span = task.offset..task.offset + task.length;

    for next in task.first + 1..=task.last {
        let unsorted = keys[next];
        let mut slot = next;

        while slot > task.first && unsorted[span.clone()] < keys[slot - 1][span.clone()] {
            keys[slot] = keys[slot - 1];
            slot -= 1;
        }
        keys[slot] = unsorted;
    }
}

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::Word;
use super::slots::{RefTag, SlotTable};
use crate::config::GcMode;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("cannot create array with negative size {0}")]
    NegativeSize(Word),
    #[error("{0:#010X} is not a live array reference")]
    InvalidReference(Word),
    #[error("array index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: Word, len: usize },
    #[error("out of heap memory allocating {words} words")]
    Exhausted { words: usize },
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Completed collection cycles (explicit and retry-triggered).
    pub cycles: u64,
    pub arrays_allocated: u64,
    pub arrays_freed: u64,
}

// =============================================================================
// ArrayHeap
// =============================================================================

/// Initial size of the array identity table.
pub const ARRAY_TABLE_INITIAL: usize = 64;
/// Growth factor of the array identity table.
pub const ARRAY_TABLE_GROWTH: usize = 8;
/// Default limit on live array words (1 GiB of elements).
pub const DEFAULT_HEAP_LIMIT: usize = 1 << 28;

/// Fixed-size integer arrays addressed through tagged references.
///
/// Arrays are only ever released by [`ArrayHeap::collect`] or
/// [`ArrayHeap::destroy`]; programs have no explicit free.
#[derive(Debug)]
pub struct ArrayHeap {
    arrays: SlotTable<Box<[Word]>>,
    /// Sum of the lengths of all live arrays.
    live_words: usize,
    limit: Option<usize>,
    mode: GcMode,
    stats: GcStats,
}

impl Default for ArrayHeap {
    fn default() -> Self {
        Self::new(GcMode::default(), Some(DEFAULT_HEAP_LIMIT))
    }
}

impl ArrayHeap {
    pub fn new(mode: GcMode, limit: Option<usize>) -> Self {
        Self {
            arrays: SlotTable::new(RefTag::ARRAY, ARRAY_TABLE_INITIAL, ARRAY_TABLE_GROWTH),
            live_words: 0,
            limit,
            mode,
            stats: GcStats::default(),
        }
    }

    pub fn mode(&self) -> GcMode {
        self.mode
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Number of live arrays.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn live_words(&self) -> usize {
        self.live_words
    }

    /// Live arrays as `(reference, elements)`, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Word, &[Word])> + '_ {
        self.arrays.iter().map(|(r, a)| (r, &a[..]))
    }

    /// Allocate a zeroed array of `count` words.
    ///
    /// When the allocation cannot be satisfied a collection over `roots` is
    /// run and the allocation retried once.
    pub fn create(&mut self, count: Word, roots: &[Word]) -> Result<Word, HeapError> {
        if count < 0 {
            return Err(HeapError::NegativeSize(count));
        }
        let words = count as usize;
        if let Some(reference) = self.try_create(words) {
            return Ok(reference);
        }

        warn!(words, live = self.arrays.len(), "array allocation failed, collecting before retry");
        self.collect(roots);
        self.try_create(words)
            .ok_or(HeapError::Exhausted { words })
    }

    fn try_create(&mut self, words: usize) -> Option<Word> {
        // The limit is checked before anything is allocated.
        if self.limit.is_some_and(|limit| self.live_words.saturating_add(words) > limit) {
            return None;
        }
        let mut elements = Vec::new();
        elements.try_reserve_exact(words).ok()?;
        elements.resize(words, 0);

        let reference = self.arrays.insert(elements.into_boxed_slice()).ok()?;
        self.live_words += words;
        self.stats.arrays_allocated += 1;
        Some(reference)
    }

    pub fn get(&self, reference: Word, index: Word) -> Result<Word, HeapError> {
        let array = self
            .arrays
            .get(reference)
            .map_err(|_| HeapError::InvalidReference(reference))?;
        let slot = checked_index(index, array.len())?;
        Ok(array[slot])
    }

    pub fn set(&mut self, reference: Word, index: Word, value: Word) -> Result<(), HeapError> {
        let array = self
            .arrays
            .get_mut(reference)
            .map_err(|_| HeapError::InvalidReference(reference))?;
        let slot = checked_index(index, array.len())?;
        array[slot] = value;
        Ok(())
    }

    // ========================================
    // Garbage collection
    // ========================================

    /// Mark-sweep collection with `roots` as the root set.
    ///
    /// Returns the number of arrays freed. The identity table never shrinks.
    pub fn collect(&mut self, roots: &[Word]) -> usize {
        let marked = self.mark(roots);
        let freed = self.sweep(&marked);

        self.stats.cycles += 1;
        self.stats.arrays_freed += freed as u64;
        debug!(
            freed,
            live = self.arrays.len(),
            live_words = self.live_words,
            mode = ?self.mode,
            "gc cycle"
        );
        freed
    }

    fn mark(&self, roots: &[Word]) -> Vec<bool> {
        let mut marked = vec![false; self.arrays.capacity()];
        let mut worklist = Vec::new();

        for &word in roots {
            if let Ok(index) = self.arrays.index_of(word) {
                if !marked[index] {
                    marked[index] = true;
                    worklist.push(index);
                }
            }
        }

        match self.mode {
            GcMode::Shallow => {
                // One pass over the arrays reached directly from the roots.
                for parent in worklist {
                    for child in self.children(parent) {
                        marked[child] = true;
                    }
                }
            }
            GcMode::Transitive => {
                while let Some(parent) = worklist.pop() {
                    for child in self.children(parent) {
                        if !marked[child] {
                            marked[child] = true;
                            worklist.push(child);
                        }
                    }
                }
            }
        }
        marked
    }

    /// Slot indices referenced from the elements of `parent`, self
    /// references excluded.
    fn children(&self, parent: usize) -> impl Iterator<Item = usize> + '_ {
        self.arrays
            .at(parent)
            .into_iter()
            .flat_map(|elements| elements.iter())
            .filter_map(|&word| self.arrays.index_of(word).ok())
            .filter(move |&child| child != parent)
    }

    fn sweep(&mut self, marked: &[bool]) -> usize {
        let mut freed = 0;
        for (index, &live) in marked.iter().enumerate() {
            if live {
                continue;
            }
            if let Some(array) = self.arrays.take_at(index) {
                self.live_words -= array.len();
                freed += 1;
            }
        }
        freed
    }

    /// Free every array and the identity table. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let arrays = self.arrays.drain();
        if !arrays.is_empty() {
            debug!(arrays = arrays.len(), "array heap destroyed");
        }
        self.live_words = 0;
        self.stats = GcStats::default();
    }
}

fn checked_index(index: Word, len: usize) -> Result<usize, HeapError> {
    if index < 0 || index as usize >= len {
        return Err(HeapError::IndexOutOfBounds { index, len });
    }
    Ok(index as usize)
}

//! Tagged handles and the slot table behind them.
//!
//! Heap-owned machine objects (arrays, connections) never escape as
//! pointers. Programs only see a word whose bit pattern carries a fixed tag
//! and a dense slot index:
//!
//! ```text
//! +-----------+------------------------+-------+
//! | tag (8)   | slot index (20)        | tag(4)|
//! | bits 24-31| bits 4-23              | 0-3   |
//! +-----------+------------------------+-------+
//! ```
//!
//! A word whose tag bits differ is definitely not a handle of that kind,
//! which lets the collector reject ordinary integers with a single mask.

use super::Word;

/// Tag pattern shared by one family of handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefTag(u32);

impl RefTag {
    pub const ARRAY: RefTag = RefTag(0xAA00_000A);
    pub const CONNECTION: RefTag = RefTag(0xCC00_000C);

    const TAG_MASK: u32 = 0xFF00_000F;
    const INDEX_MASK: u32 = 0x00FF_FFF0;
    const INDEX_SHIFT: u32 = 4;

    /// Number of distinct slot indices a handle can carry.
    pub const MAX_SLOTS: usize = ((Self::INDEX_MASK >> Self::INDEX_SHIFT) + 1) as usize;

    pub fn pattern(self) -> u32 {
        self.0
    }

    pub fn encode(self, index: usize) -> Word {
        debug_assert!(index < Self::MAX_SLOTS);
        (self.0 | ((index as u32) << Self::INDEX_SHIFT)) as Word
    }

    pub fn matches(self, word: Word) -> bool {
        (word as u32) & Self::TAG_MASK == self.0
    }

    /// Slot index carried by `word`, or `None` when the tag does not match.
    pub fn decode(self, word: Word) -> Option<usize> {
        if !self.matches(word) {
            return None;
        }
        Some((((word as u32) & Self::INDEX_MASK) >> Self::INDEX_SHIFT) as usize)
    }
}

/// Why a handle could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Tag bits do not match the table.
    BadTag,
    /// Index is past the end of the table or the slot is unoccupied.
    Dangling,
}

/// Dense identity table mapping slot indices to owned values.
///
/// The table starts empty, is sized to `initial` slots on first insert and
/// then grows by `growth` each time it is full, up to [`RefTag::MAX_SLOTS`].
/// It never shrinks; freed slots are reused.
#[derive(Debug)]
pub struct SlotTable<T> {
    tag: RefTag,
    slots: Vec<Option<T>>,
    /// Vacant indices, lowest last so it is popped first.
    free: Vec<usize>,
    initial: usize,
    growth: usize,
    len: usize,
}

impl<T> SlotTable<T> {
    pub fn new(tag: RefTag, initial: usize, growth: usize) -> Self {
        Self {
            tag,
            slots: Vec::new(),
            free: Vec::new(),
            initial: initial.clamp(1, RefTag::MAX_SLOTS),
            growth: growth.max(2),
            len: 0,
        }
    }

    pub fn tag(&self) -> RefTag {
        self.tag
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current table size (occupied + vacant).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store `value` and return its handle.
    ///
    /// Gives the value back when the table is at its maximum size and every
    /// slot is taken.
    pub fn insert(&mut self, value: T) -> Result<Word, T> {
        if self.free.is_empty() && !self.grow() {
            return Err(value);
        }
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        self.slots[index] = Some(value);
        self.len += 1;
        Ok(self.tag.encode(index))
    }

    fn grow(&mut self) -> bool {
        let old = self.slots.len();
        let new = if old == 0 {
            self.initial
        } else {
            old.saturating_mul(self.growth).min(RefTag::MAX_SLOTS)
        };
        if new <= old {
            return false;
        }
        if self.slots.try_reserve_exact(new - old).is_err() {
            return false;
        }
        self.slots.resize_with(new, || None);
        self.free.extend((old..new).rev());
        true
    }

    pub fn index_of(&self, handle: Word) -> Result<usize, Lookup> {
        let index = self.tag.decode(handle).ok_or(Lookup::BadTag)?;
        match self.slots.get(index) {
            Some(Some(_)) => Ok(index),
            _ => Err(Lookup::Dangling),
        }
    }

    pub fn get(&self, handle: Word) -> Result<&T, Lookup> {
        let index = self.index_of(handle)?;
        self.slots[index].as_ref().ok_or(Lookup::Dangling)
    }

    pub fn get_mut(&mut self, handle: Word) -> Result<&mut T, Lookup> {
        let index = self.index_of(handle)?;
        self.slots[index].as_mut().ok_or(Lookup::Dangling)
    }

    /// Occupied value at a raw slot index.
    pub fn at(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, handle: Word) -> Result<T, Lookup> {
        let index = self.index_of(handle)?;
        Ok(self.take_at(index).expect("slot checked occupied"))
    }

    pub(crate) fn take_at(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.len -= 1;
        self.free.push(index);
        Some(value)
    }

    /// Iterate `(handle, value)` over occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Word, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (self.tag.encode(i), v)))
    }

    /// Remove every value and release the table.
    pub fn drain(&mut self) -> Vec<T> {
        let values = self.slots.drain(..).flatten().collect();
        self.free.clear();
        self.len = 0;
        values
    }
}

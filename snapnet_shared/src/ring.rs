//! Fixed-size rings.
//!
//! [`SequenceRing`] maps a sequence number to the slot `seq & mask` and
//! remembers which sequence wrote the slot, so a lookup for a sequence that
//! was overwritten (or never written) is `None` instead of stale data.
//!
//! [`ArenaRing`] is a plain modulo arena addressed by [`ParseIndex`], a
//! monotonically increasing counter that is allowed to wrap.

/// Ring of values tagged with the sequence that stored them.
#[derive(Debug, Clone)]
pub struct SequenceRing<T> {
    slots: Vec<Option<(i32, T)>>,
    mask: usize,
}

impl<T> SequenceRing<T> {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, seq: i32) -> usize {
        seq as u32 as usize & self.mask
    }

    /// Stores `value` under `seq`, evicting whatever shared the slot.
    pub fn insert(&mut self, seq: i32, value: T) {
        let i = self.slot(seq);
        self.slots[i] = Some((seq, value));
    }

    pub fn get(&self, seq: i32) -> Option<&T> {
        match &self.slots[self.slot(seq)] {
            Some((s, v)) if *s == seq => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, seq: i32) -> Option<&mut T> {
        let i = self.slot(seq);
        match &mut self.slots[i] {
            Some((s, v)) if *s == seq => Some(v),
            _ => None,
        }
    }

    pub fn remove(&mut self, seq: i32) -> Option<T> {
        let i = self.slot(seq);
        match &self.slots[i] {
            Some((s, _)) if *s == seq => self.slots[i].take().map(|(_, v)| v),
            _ => None,
        }
    }

    /// Whatever occupies the slot `seq` maps to, regardless of its tag.
    pub fn slot_mut(&mut self, seq: i32) -> Option<&mut T> {
        let i = self.slot(seq);
        self.slots[i].as_mut().map(|(_, v)| v)
    }

    pub fn contains(&self, seq: i32) -> bool {
        self.get(seq).is_some()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

/// Position in the parse entity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ParseIndex(pub u32);

impl ParseIndex {
    pub fn next(self) -> Self {
        ParseIndex(self.0.wrapping_add(1))
    }

    pub fn offset(self, n: usize) -> Self {
        ParseIndex(self.0.wrapping_add(n as u32))
    }

    /// Entries written between `earlier` and `self`.
    pub fn since(self, earlier: ParseIndex) -> usize {
        self.0.wrapping_sub(earlier.0) as usize
    }
}

/// Modulo arena addressed by [`ParseIndex`].
#[derive(Debug, Clone)]
pub struct ArenaRing<T> {
    items: Vec<T>,
    mask: usize,
}

impl<T: Clone + Default> ArenaRing<T> {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            items: vec![T::default(); capacity],
            mask: capacity - 1,
        }
    }
}

impl<T> ArenaRing<T> {
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, at: ParseIndex) -> &T {
        &self.items[at.0 as usize & self.mask]
    }

    pub fn set(&mut self, at: ParseIndex, value: T) {
        let i = at.0 as usize & self.mask;
        self.items[i] = value;
    }
}

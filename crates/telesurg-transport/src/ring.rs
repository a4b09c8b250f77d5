//! Fixed-capacity ring of recent instrument states

use telesurg_core::InstrumentState;

/// Default states kept per instrument (one second at 1 kHz)
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Overwrites the oldest entry when full
#[derive(Debug, Clone)]
pub struct StateRing {
    slots: Vec<InstrumentState>,
    capacity: usize,
    /// Next write position
    head: usize,
    len: usize,
}

impl StateRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        StateRing {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, state: InstrumentState) {
        if self.slots.len() < self.capacity {
            self.slots.push(state);
        } else {
            self.slots[self.head] = state;
        }
        self.head = (self.head + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&InstrumentState> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity - 1) % self.capacity;
        self.slots.get(idx)
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &InstrumentState> {
        let start = if self.len < self.capacity { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.slots.get((start + i) % self.capacity))
    }

    /// Copy the newest `max` states into `out`, oldest first
    pub fn copy_recent(&self, max: usize, out: &mut Vec<InstrumentState>) {
        out.clear();
        let skip = self.len.saturating_sub(max);
        out.extend(self.iter().skip(skip).copied());
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = 0;
        self.len = 0;
    }
}

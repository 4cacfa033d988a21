//! # Priority Overlay
//! Frequency-ranked queue of externally requested items.
//!
//! Repeat requests accumulate weight; `dequeue` hands out the heaviest id and forgets it
//! entirely. The overlay is re-sorted on every enqueue, which is fine because it only ever
//! holds user-triggered volume, never the whole catalog.

use crate::upstream::ItemId;

#[derive(Debug, Clone, Default)]
pub struct PriorityOverlay {
    /// `(id, accumulated weight)`, heaviest first. Equal weights keep first-enqueued order.
    entries: Vec<(ItemId, u64)>,
}

impl PriorityOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `weight` to `id` (compounding on repeats) and re-rank. Weights below 1 count as 1.
    pub fn enqueue(&mut self, id: ItemId, weight: u64) {
        let weight = weight.max(1);
        match self.entries.iter_mut().find(|(e, _)| *e == id) {
            Some((_, w)) => *w = w.saturating_add(weight),
            None => self.entries.push((id, weight)),
        }
        // Stable sort keeps arrival order among ties.
        self.entries.sort_by(|a, b| b.1.cmp(&a.1));
    }

    /// Remove and return the id with the highest accumulated weight.
    pub fn dequeue(&mut self) -> Option<ItemId> {
        self.dequeue_weighted().map(|(id, _)| id)
    }

    /// Like [`dequeue`](Self::dequeue), also returning the weight the id had accumulated.
    pub fn dequeue_weighted(&mut self) -> Option<(ItemId, u64)> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0))
    }

    pub fn weight_of(&self, id: ItemId) -> Option<u64> {
        self.entries.iter().find(|(e, _)| *e == id).map(|(_, w)| *w)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

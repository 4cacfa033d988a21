//! # Event Store & Change Detector
//! Newest-known events per catalog item, capped, plus the possibly-changed hint map fed by
//! the out-of-band push feed.
//!
//! A fetched list only replaces the stored one when its newest timestamp is strictly newer.
//! Ties and older lists are dropped silently; that is what filters repeat fetches from noise.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::upstream::{newest_first, Event, ItemId};

pub const DEFAULT_EVENTS_CAP: usize = 10;

/// A committed change, as announced to live subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub item_id: ItemId,
    /// Events newer than what was stored before (all of them on first sight).
    pub new_event_count: usize,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    cap: usize,
    items: HashMap<ItemId, Vec<Event>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::with_cap(DEFAULT_EVENTS_CAP)
    }
}

impl EventStore {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            items: HashMap::new(),
        }
    }

    /// Rehydrate from the `events` checkpoint section, re-applying the cap.
    pub fn from_saved(cap: usize, saved: HashMap<ItemId, Vec<Event>>) -> Self {
        let mut store = Self::with_cap(cap);
        for (id, events) in saved {
            let mut events = newest_first(events);
            events.truncate(store.cap);
            if !events.is_empty() {
                store.items.insert(id, events);
            }
        }
        store
    }

    /// Offer a freshly fetched list for `item`. Returns the commit if it replaced the stored list.
    pub fn apply(&mut self, item: ItemId, events: Vec<Event>) -> Option<Commit> {
        let mut events = newest_first(events);
        events.truncate(self.cap);
        let incoming = events.first()?.timestamp;

        let stored = self.newest(item);
        if stored.is_some_and(|ts| incoming <= ts) {
            tracing::trace!(target: "store", item, incoming, ?stored, "no newer events");
            return None;
        }

        let new_event_count = match stored {
            Some(ts) => events.iter().filter(|e| e.timestamp > ts).count(),
            None => events.len(),
        };
        self.items.insert(item, events);
        Some(Commit {
            item_id: item,
            new_event_count,
        })
    }

    pub fn events(&self, item: ItemId) -> Option<&[Event]> {
        self.items.get(&item).map(Vec::as_slice)
    }

    pub fn newest(&self, item: ItemId) -> Option<i64> {
        self.items
            .get(&item)
            .and_then(|v| v.first())
            .map(|e| e.timestamp)
    }

    /// True when the push feed flagged `item` after the newest event we hold for it.
    pub fn possibly_stale(&self, hints: &HintMap, item: ItemId) -> bool {
        match (hints.get(item), self.newest(item)) {
            (Some(hinted), Some(newest)) => hinted > newest,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn total_events(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn as_map(&self) -> &HashMap<ItemId, Vec<Event>> {
        &self.items
    }
}

/// Item id → unix seconds when the push feed last said it may have changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HintMap(HashMap<ItemId, i64>);

impl HintMap {
    pub fn mark(&mut self, ids: &[ItemId], now_unix: i64) {
        for &id in ids {
            self.0.insert(id, now_unix);
        }
    }

    pub fn get(&self, id: ItemId) -> Option<i64> {
        self.0.get(&id).copied()
    }

    /// A successful fetch at `checked_at` answers any hint stamped at or before it.
    pub fn settle(&mut self, id: ItemId, checked_at: i64) -> bool {
        match self.0.get(&id) {
            Some(&hinted) if hinted <= checked_at => {
                self.0.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Drop hints for ids the catalog no longer lists. Returns how many went.
    pub fn retain_known(&mut self, known: &HashSet<ItemId>) -> usize {
        let before = self.0.len();
        self.0.retain(|id, _| known.contains(id));
        before - self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

//! # Aggregation Merge
//! Folds many per-item event lists into one list ordered newest first.
//!
//! Two strategies:
//! - small page out of a big corpus (`requested * 4 < total`): bounded min-heap selection,
//!   never materialising the full corpus;
//! - otherwise collect everything and sort, handing sorts above `parallel_threshold` to a
//!   rayon worker so the caller's task stays responsive.
//!
//! Both rank by `(timestamp desc, item id asc, position in item list asc)`, so they agree on
//! the top `k` exactly.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use anyhow::{Context, Result};
use metrics::histogram;
use rayon::slice::ParallelSliceMut;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::upstream::{Event, ItemId};

pub const DEFAULT_PARALLEL_THRESHOLD: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    timestamp: i64,
    item: Reverse<ItemId>,
    slot: Reverse<usize>,
}

impl Key {
    fn public(self) -> (i64, ItemId) {
        (self.timestamp, self.item.0)
    }
}

fn keys(lists: &[(ItemId, Vec<Event>)]) -> impl Iterator<Item = Key> + '_ {
    lists.iter().flat_map(|(item, events)| {
        events.iter().enumerate().map(move |(slot, e)| Key {
            timestamp: e.timestamp,
            item: Reverse(*item),
            slot: Reverse(slot),
        })
    })
}

/// Merge per-item lists into `(timestamp, item id)` pairs, newest first, truncated to
/// `requested` when given.
pub async fn merge(
    lists: &[(ItemId, Vec<Event>)],
    requested: Option<usize>,
    total: usize,
    parallel_threshold: usize,
) -> Result<Vec<(i64, ItemId)>> {
    let ranked = merge_keys(lists, requested, total, parallel_threshold).await?;
    Ok(ranked.into_iter().map(Key::public).collect())
}

async fn merge_keys(
    lists: &[(ItemId, Vec<Event>)],
    requested: Option<usize>,
    total: usize,
    parallel_threshold: usize,
) -> Result<Vec<Key>> {
    let t0 = std::time::Instant::now();
    let out = match requested {
        Some(k) if k.saturating_mul(4) < total => select_top(lists, k),
        _ => {
            let collected: Vec<Key> = keys(lists).collect();
            let mut sorted = if collected.len() > parallel_threshold {
                sort_on_worker(collected).await?
            } else {
                sort_desc(collected)
            };
            if let Some(k) = requested {
                sorted.truncate(k);
            }
            sorted
        }
    };
    histogram!("merge_duration_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(out)
}

/// Keep the best `k` in a min-heap, evicting the smallest whenever it grows past `k`.
fn select_top(lists: &[(ItemId, Vec<Event>)], k: usize) -> Vec<Key> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Key>> = BinaryHeap::with_capacity(k + 1);
    for key in keys(lists) {
        heap.push(Reverse(key));
        if heap.len() > k {
            heap.pop();
        }
    }
    // ascending by Reverse == descending by key
    heap.into_sorted_vec().into_iter().map(|Reverse(k)| k).collect()
}

fn sort_desc(mut v: Vec<Key>) -> Vec<Key> {
    v.sort_unstable_by(|a, b| b.cmp(a));
    v
}

/// Owned list in, new owned list out; nothing shared with the caller.
async fn sort_on_worker(mut v: Vec<Key>) -> Result<Vec<Key>> {
    let (tx, rx) = oneshot::channel();
    rayon::spawn(move || {
        v.par_sort_unstable_by(|a, b| b.cmp(a));
        let _ = tx.send(v);
    });
    rx.await.context("merge sort worker went away")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub item_id: ItemId,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesPage {
    pub updates: Vec<ItemUpdate>,
    pub has_more: bool,
    pub next_offset: usize,
}

/// One page of the merged timeline for the requested items. Callers repeat with
/// `next_offset` until `has_more` is false.
pub async fn page_updates(
    lists: Vec<(ItemId, Vec<Event>)>,
    page_size: usize,
    offset: usize,
    parallel_threshold: usize,
) -> Result<UpdatesPage> {
    let page_size = page_size.max(1);
    let mut seen = HashSet::new();
    let lists: Vec<(ItemId, Vec<Event>)> = lists
        .into_iter()
        .filter(|(id, events)| !events.is_empty() && seen.insert(*id))
        .collect();
    let total: usize = lists.iter().map(|(_, e)| e.len()).sum();

    let wanted = offset.saturating_add(page_size);
    let ranked = merge_keys(&lists, Some(wanted), total, parallel_threshold).await?;
    let page = &ranked[offset.min(ranked.len())..];

    // group back per item, in order of first appearance on the page
    let mut updates: Vec<ItemUpdate> = Vec::new();
    for key in page {
        let item_id = key.item.0;
        let Some((_, events)) = lists.iter().find(|(id, _)| *id == item_id) else {
            continue;
        };
        let event = events[key.slot.0].clone();
        match updates.iter_mut().find(|u| u.item_id == item_id) {
            Some(u) => u.events.push(event),
            None => updates.push(ItemUpdate {
                item_id,
                events: vec![event],
            }),
        }
    }

    let next_offset = offset + page.len();
    Ok(UpdatesPage {
        updates,
        has_more: next_offset < total,
        next_offset,
    })
}

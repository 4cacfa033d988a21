// src/acquire/state.rs
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::acquire::cursor::ScanCursor;
use crate::acquire::governor::{Governor, GovernorStatus, QuotaPolicy};
use crate::acquire::overlay::PriorityOverlay;
use crate::checkpoint::{Checkpoint, CheckpointSnapshot};
use crate::config::SchedulerConfig;
use crate::store::{EventStore, HintMap};
use crate::upstream::ItemId;

/// All mutable scheduler state. Owned by the acquisition loop; everyone else gets copies.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub governor: Governor,
    pub cursor: ScanCursor,
    pub overlay: PriorityOverlay,
    /// Caller-triggered ids, served one per tick ahead of the overlay.
    pub direct: VecDeque<ItemId>,
    pub store: EventStore,
    pub hints: HintMap,
    /// Bumped on every change to checkpointed state.
    pub revision: u64,
}

impl SchedulerState {
    pub fn fresh(cfg: &SchedulerConfig, now: DateTime<Utc>) -> Self {
        Self::from_checkpoint(Checkpoint::default(), cfg, now)
    }

    pub fn from_checkpoint(cp: Checkpoint, cfg: &SchedulerConfig, now: DateTime<Utc>) -> Self {
        let policy = QuotaPolicy::new(
            cfg.daily_quota,
            cfg.quota_safety_margin,
            cfg.default_pause_secs,
        );
        let governor = match cp.quota {
            Some(saved) => Governor::restore(policy, saved, now),
            None => Governor::fresh(policy, now),
        };
        Self {
            governor,
            cursor: ScanCursor::restore(cp.cursor, cp.errors),
            overlay: PriorityOverlay::new(),
            direct: VecDeque::new(),
            store: EventStore::from_saved(cfg.events_cap, cp.events),
            hints: cp.hints,
            revision: 0,
        }
    }

    pub fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            events: self.store.as_map().clone(),
            errors: self.cursor.errored().clone(),
            cursor: self.cursor.state(),
            hints: self.hints.clone(),
            quota: Some(self.governor.snapshot()),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> CheckpointSnapshot {
        CheckpointSnapshot {
            revision: self.revision,
            exhausted: self.governor.status(now) == GovernorStatus::Exhausted,
            checkpoint: self.checkpoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::cursor::CursorState;
    use crate::acquire::governor::QuotaState;
    use crate::upstream::{CatalogItem, Event};
    use chrono::TimeZone;
    use std::collections::{BTreeSet, HashMap};

    #[test]
    fn checkpoint_roundtrips_through_state() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let cfg = SchedulerConfig::default();
        let mut hints = HintMap::default();
        hints.mark(&[2], 500);
        let cp = Checkpoint {
            events: HashMap::from([(
                1,
                vec![Event {
                    timestamp: 400,
                    body: "b".into(),
                }],
            )]),
            errors: BTreeSet::from([3]),
            cursor: CursorState {
                index: 1,
                item_id: Some(2),
                catalog: (1..=3)
                    .map(|id| CatalogItem {
                        id,
                        name: format!("n{id}"),
                    })
                    .collect(),
            },
            hints,
            quota: Some(QuotaState {
                remaining: 1_000,
                epoch_start: now,
                paused_until: None,
            }),
        };

        let state = SchedulerState::from_checkpoint(cp.clone(), &cfg, now);
        assert_eq!(state.governor.remaining(), 800);
        assert_eq!(state.cursor.current().map(|it| it.id), Some(2));

        let back = state.checkpoint();
        assert_eq!(back.events, cp.events);
        assert_eq!(back.errors, cp.errors);
        assert_eq!(back.cursor, cp.cursor);
        assert_eq!(back.hints, cp.hints);
        assert!(!state.snapshot(now).exhausted);
    }
}

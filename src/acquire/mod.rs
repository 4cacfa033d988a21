//! # Acquisition Loop
//! Tick-driven orchestrator. Each tick asks the governor for permission, resolves one target
//! (direct request, then overlay, then round-robin cursor), calls the upstream through the
//! rate gate and routes the answer into the store, the error set or the governor.
//!
//! Ticks are strictly serial: the loop task owns [`SchedulerState`] and a tick runs to
//! completion, upstream call included, before the next command or tick is looked at.

pub mod cursor;
pub mod gate;
pub mod governor;
pub mod handle;
pub mod overlay;
pub mod refresh;
pub mod state;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;

use crate::fanout::{LiveFanout, LiveMessage};
use crate::store::Commit;
use crate::upstream::{CatalogItem, FetchOutcome, ItemId, Upstream};

pub use gate::RateGate;
pub use governor::GovernorStatus;
pub use handle::{ItemView, SchedulerHandle, StatusView};
pub use state::SchedulerState;

/// Where a tick's target came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Direct,
    Overlay,
    RoundRobin,
}

impl Source {
    pub fn priority(self) -> i32 {
        match self {
            Source::Direct => gate::priority::DIRECT,
            Source::Overlay => gate::priority::OVERLAY,
            Source::RoundRobin => gate::priority::ROUND_ROBIN,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Source::Direct => "direct",
            Source::Overlay => "overlay",
            Source::RoundRobin => "round_robin",
        }
    }
}

/// What happened to an upstream answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Committed(Commit),
    /// Success, but nothing newer than what is stored.
    Unchanged,
    Errored { status: u16 },
    RateLimited,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Governor said no; nothing resolved, nothing called.
    Idle(GovernorStatus),
    /// Nothing to query: empty queues and an empty or fully errored catalog.
    NoTarget,
    /// The rate gate went away before admitting the call. Not charged.
    Aborted,
    Fetched {
        item: ItemId,
        source: Source,
        routed: Routed,
    },
}

#[derive(Debug, Clone, Copy)]
struct Target {
    item: ItemId,
    source: Source,
    /// Overlay weight at dequeue, so an aborted call can be put back as it was.
    weight: u64,
}

pub struct Scheduler {
    state: SchedulerState,
    upstream: Arc<dyn Upstream>,
    gate: RateGate,
    fanout: LiveFanout,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(
        state: SchedulerState,
        upstream: Arc<dyn Upstream>,
        gate: RateGate,
        fanout: LiveFanout,
        tick_period: Duration,
    ) -> Self {
        Self {
            state,
            upstream,
            gate,
            fanout,
            tick_period,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn fanout(&self) -> &LiveFanout {
        &self.fanout
    }

    /// One acquisition step at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        counter!("acquire_ticks_total").increment(1);

        let status = self.state.governor.evaluate(now);
        if status != GovernorStatus::Active {
            return TickOutcome::Idle(status);
        }

        let Some(target) = self.resolve() else {
            tracing::trace!(target: "acquire", "no target this tick");
            return TickOutcome::NoTarget;
        };

        let upstream = Arc::clone(&self.upstream);
        let item = target.item;
        let answer = self
            .gate
            .dispatch(target.source.priority(), move || async move {
                upstream.fetch_events(item).await
            })
            .await;
        let outcome = match answer {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(target: "acquire", item, "dispatch aborted: {e:#}");
                self.requeue(target);
                return TickOutcome::Aborted;
            }
        };

        self.state.governor.consume();
        self.state.touch();
        counter!("upstream_calls_total", "source" => target.source.label()).increment(1);

        let routed = self.route(item, outcome, now);
        if target.source == Source::RoundRobin
            && !matches!(routed, Routed::RateLimited | Routed::Blocked)
        {
            self.state.cursor.advance();
        }

        tracing::debug!(
            target: "acquire",
            item,
            source = target.source.label(),
            ?routed,
            remaining = self.state.governor.remaining(),
            "tick"
        );
        TickOutcome::Fetched {
            item,
            source: target.source,
            routed,
        }
    }

    fn resolve(&mut self) -> Option<Target> {
        if let Some(item) = self.state.direct.pop_front() {
            return Some(Target {
                item,
                source: Source::Direct,
                weight: 0,
            });
        }
        if let Some((item, weight)) = self.state.overlay.dequeue_weighted() {
            return Some(Target {
                item,
                source: Source::Overlay,
                weight,
            });
        }
        self.state.cursor.next_target().map(|item| Target {
            item,
            source: Source::RoundRobin,
            weight: 0,
        })
    }

    fn requeue(&mut self, target: Target) {
        match target.source {
            Source::Direct => self.state.direct.push_front(target.item),
            Source::Overlay => self.state.overlay.enqueue(target.item, target.weight),
            Source::RoundRobin => {}
        }
    }

    fn route(&mut self, item: ItemId, outcome: FetchOutcome, now: DateTime<Utc>) -> Routed {
        match outcome {
            FetchOutcome::Success(events) => {
                if self.state.cursor.clear_errored(item) {
                    tracing::info!(target: "acquire", item, "item answered again; removed from error set");
                }
                if self.state.hints.settle(item, now.timestamp()) {
                    tracing::trace!(target: "acquire", item, "possibly-changed hint settled");
                }
                match self.state.store.apply(item, events) {
                    Some(commit) => {
                        counter!("store_commits_total").increment(1);
                        self.fanout.publish(LiveMessage::from(commit));
                        Routed::Committed(commit)
                    }
                    None => Routed::Unchanged,
                }
            }
            FetchOutcome::Failure { status } => {
                counter!("upstream_failures_total").increment(1);
                if self.state.cursor.mark_errored(item) {
                    tracing::info!(target: "acquire", item, status, "item marked permanently errored");
                }
                Routed::Errored { status }
            }
            FetchOutcome::RateLimited { retry_after } => {
                self.state.governor.on_rate_limited(retry_after, now);
                Routed::RateLimited
            }
            FetchOutcome::Blocked { retry_after } => {
                self.state.governor.on_blocked(retry_after, now);
                Routed::Blocked
            }
        }
    }

    /// Serve `item` on a coming tick ahead of everything else.
    pub fn request_now(&mut self, item: ItemId) {
        if !self.state.direct.contains(&item) {
            self.state.direct.push_back(item);
        }
    }

    pub fn enqueue(&mut self, item: ItemId, weight: u64) {
        self.state.overlay.enqueue(item, weight);
    }

    /// Push-feed entry: stamp the hint map and forward the ids to live subscribers.
    pub fn push_hint(&mut self, items: Vec<ItemId>, now: DateTime<Utc>) {
        if items.is_empty() {
            return;
        }
        self.state.hints.mark(&items, now.timestamp());
        self.state.touch();
        self.fanout
            .publish(LiveMessage::PossiblyChanged { item_ids: items });
    }

    pub fn replace_catalog(&mut self, catalog: Vec<CatalogItem>) {
        let before = self.state.cursor.catalog().len();
        self.state.cursor.replace_catalog(catalog);
        let known: HashSet<ItemId> = self.state.cursor.catalog().iter().map(|it| it.id).collect();
        let pruned_hints = self.state.hints.retain_known(&known);
        self.state.touch();
        tracing::info!(
            target: "acquire",
            before,
            after = self.state.cursor.catalog().len(),
            cursor = self.state.cursor.index(),
            pruned_hints,
            "catalog replaced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::upstream::providers::fixture::FixtureUpstream;
    use crate::upstream::Event;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn catalog(ids: &[ItemId]) -> Vec<CatalogItem> {
        ids.iter()
            .map(|&id| CatalogItem {
                id,
                name: format!("item-{id}"),
            })
            .collect()
    }

    fn scheduler(up: Arc<FixtureUpstream>, ids: &[ItemId]) -> Scheduler {
        let mut state = SchedulerState::fresh(&SchedulerConfig::default(), now());
        state.cursor.replace_catalog(catalog(ids));
        Scheduler::new(
            state,
            up,
            RateGate::spawn(1_000, Duration::from_millis(1)),
            LiveFanout::default(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn gate_closed_requeues_without_charging() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        let mut s = scheduler(up.clone(), &[1]);
        s.gate = RateGate::closed();

        s.request_now(9);
        let before = s.state().governor.remaining();
        assert_eq!(s.tick(now()).await, TickOutcome::Aborted);
        assert_eq!(s.state().governor.remaining(), before);
        assert_eq!(s.state().direct.front(), Some(&9));
        assert!(up.calls().is_empty());
    }

    #[tokio::test]
    async fn success_on_errored_item_clears_it() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        up.script(5, FetchOutcome::Failure { status: 404 });
        up.script(
            5,
            FetchOutcome::Success(vec![Event {
                timestamp: 10,
                body: "back".into(),
            }]),
        );
        let mut s = scheduler(up, &[5]);

        let first = s.tick(now()).await;
        assert!(matches!(
            first,
            TickOutcome::Fetched {
                routed: Routed::Errored { status: 404 },
                ..
            }
        ));
        assert_eq!(s.tick(now()).await, TickOutcome::NoTarget);

        s.request_now(5);
        let again = s.tick(now()).await;
        assert!(matches!(
            again,
            TickOutcome::Fetched {
                source: Source::Direct,
                routed: Routed::Committed(_),
                ..
            }
        ));
        assert!(!s.state().cursor.is_errored(5));
    }

    #[tokio::test]
    async fn duplicate_direct_requests_collapse() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        let mut s = scheduler(up, &[]);
        s.request_now(3);
        s.request_now(3);
        s.request_now(4);
        assert_eq!(s.state().direct, [3, 4]);
    }

    #[tokio::test]
    async fn hint_is_stamped_and_broadcast() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        let mut s = scheduler(up, &[]);
        let mut rx = s.fanout().subscribe();
        let rev = s.state().revision;

        s.push_hint(vec![7, 8], now());
        assert_eq!(s.state().hints.get(8), Some(now().timestamp()));
        assert_eq!(s.state().revision, rev + 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            LiveMessage::PossiblyChanged {
                item_ids: vec![7, 8]
            }
        );
    }

    #[tokio::test]
    async fn hinted_item_is_rechecked_once_per_hint() {
        let up = Arc::new(
            FixtureUpstream::new(Vec::new()).with_fallback(FetchOutcome::Success(vec![Event {
                timestamp: 1_000,
                body: "old news".into(),
            }])),
        );
        let mut s = scheduler(up.clone(), &[]);
        let before = s.state().governor.remaining();
        s.push_hint(vec![42], now());

        assert!(s.item_view(42).recheck_queued);
        s.tick(now()).await;
        for _ in 0..4 {
            let view = s.item_view(42);
            assert!(!view.recheck_queued);
            assert_eq!(view.hinted_at, None);
            assert_eq!(s.tick(now()).await, TickOutcome::NoTarget);
        }
        assert_eq!(up.calls(), vec![42]);
        assert_eq!(s.state().governor.remaining(), before - 1);

        // a later hint asks again
        s.push_hint(vec![42], now() + chrono::Duration::seconds(5));
        assert!(s.item_view(42).recheck_queued);
    }

    #[tokio::test]
    async fn failed_recheck_keeps_the_hint() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        up.script(42, FetchOutcome::RateLimited { retry_after: None });
        let mut s = scheduler(up, &[]);
        s.push_hint(vec![42], now());
        s.item_view(42);
        s.tick(now()).await;
        assert_eq!(s.state().hints.get(42), Some(now().timestamp()));
    }

    #[tokio::test]
    async fn zero_weight_enqueue_still_counts() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        let mut s = scheduler(up, &[]);
        s.enqueue(620, 0);
        assert_eq!(s.state().overlay.weight_of(620), Some(1));
        s.enqueue(620, 0);
        assert_eq!(s.state().overlay.weight_of(620), Some(2));
    }

    #[tokio::test]
    async fn catalog_replace_prunes_delisted_hints() {
        let up = Arc::new(FixtureUpstream::new(Vec::new()));
        let mut s = scheduler(up, &[1, 2]);
        s.push_hint(vec![1, 9], now());
        s.replace_catalog(catalog(&[1, 3]));
        assert_eq!(s.state().hints.get(1), Some(now().timestamp()));
        assert_eq!(s.state().hints.get(9), None);
    }
}

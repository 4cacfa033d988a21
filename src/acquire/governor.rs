//! # Quota & Backoff Governor
//! Tracks the daily request budget, the rolling 24h epoch and the global pause imposed by
//! upstream rate-limit/block answers.
//!
//! `remaining` only ever goes down inside an epoch; the single place it is raised is
//! [`Governor::roll_if_due`]. Every method takes `now` explicitly so the state machine can
//! be driven deterministically from tests.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernorStatus {
    Active,
    Paused,
    Exhausted,
}

/// Persisted part of the governor (the `quota` checkpoint section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub remaining: u32,
    pub epoch_start: DateTime<Utc>,
    #[serde(default)]
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    /// Requests allowed per epoch.
    pub ceiling: u32,
    /// Subtracted from the persisted `remaining` on restart.
    pub safety_margin: u32,
    /// Pause applied to a rate-limit answer that carries no retry delay.
    pub default_pause: Duration,
    pub epoch: Duration,
}

impl QuotaPolicy {
    pub fn new(ceiling: u32, safety_margin: u32, default_pause_secs: u64) -> Self {
        Self {
            ceiling,
            safety_margin,
            default_pause: Duration::seconds(default_pause_secs as i64),
            epoch: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Governor {
    policy: QuotaPolicy,
    state: QuotaState,
    /// Set the first time an evaluation lands on EXHAUSTED, cleared at rollover.
    exhausted_flagged: bool,
}

impl Governor {
    /// First-ever start: full budget, epoch starting now.
    pub fn fresh(policy: QuotaPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            state: QuotaState {
                remaining: policy.ceiling,
                epoch_start: now,
                paused_until: None,
            },
            exhausted_flagged: false,
        }
    }

    /// Resume from a checkpoint. The safety margin covers calls made after the last
    /// checkpoint of an unclean shutdown.
    pub fn restore(policy: QuotaPolicy, saved: QuotaState, now: DateTime<Utc>) -> Self {
        let remaining = saved
            .remaining
            .saturating_sub(policy.safety_margin)
            .min(policy.ceiling);
        let mut g = Self {
            policy,
            state: QuotaState {
                remaining,
                ..saved
            },
            exhausted_flagged: false,
        };
        g.roll_if_due(now);
        g
    }

    pub fn next_rollover(&self) -> DateTime<Utc> {
        self.state.epoch_start + self.policy.epoch
    }

    /// Reset the budget if the current epoch has run out. Returns true on rollover.
    pub fn roll_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.next_rollover() {
            return false;
        }
        tracing::info!(
            target: "acquire",
            previous_epoch = %self.state.epoch_start,
            left_unused = self.state.remaining,
            "quota epoch rollover"
        );
        self.state.remaining = self.policy.ceiling;
        self.state.epoch_start = now;
        self.exhausted_flagged = false;
        gauge!("quota_remaining").set(self.state.remaining as f64);
        true
    }

    /// Pure read of the state machine at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> GovernorStatus {
        if self.state.paused_until.is_some_and(|until| now < until) {
            GovernorStatus::Paused
        } else if self.state.remaining == 0 {
            GovernorStatus::Exhausted
        } else {
            GovernorStatus::Active
        }
    }

    /// Per-tick evaluation: rollover, pause expiry, one-shot EXHAUSTED flag.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> GovernorStatus {
        self.roll_if_due(now);
        if let Some(until) = self.state.paused_until {
            if now >= until {
                tracing::info!(target: "acquire", "upstream pause elapsed, resuming");
                self.state.paused_until = None;
            }
        }
        let status = self.status(now);
        if status == GovernorStatus::Exhausted && !self.exhausted_flagged {
            self.exhausted_flagged = true;
            counter!("quota_exhausted_total").increment(1);
            tracing::warn!(
                target: "acquire",
                next_rollover = %self.next_rollover(),
                "daily quota exhausted; no upstream calls until rollover"
            );
        }
        status
    }

    /// Charge one upstream call. Floors at zero.
    pub fn consume(&mut self) {
        self.state.remaining = self.state.remaining.saturating_sub(1);
        gauge!("quota_remaining").set(self.state.remaining as f64);
    }

    pub fn on_rate_limited(&mut self, retry_after: Option<std::time::Duration>, now: DateTime<Utc>) {
        let pause = retry_after
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or(self.policy.default_pause);
        counter!("upstream_rate_limited_total").increment(1);
        tracing::warn!(target: "acquire", pause_secs = pause.num_seconds(), "upstream rate limited; pausing");
        self.pause_for(pause, now);
    }

    /// A block with a usable delay pauses; without one the rest of the epoch is written off.
    pub fn on_blocked(&mut self, retry_after: Option<std::time::Duration>, now: DateTime<Utc>) {
        counter!("upstream_blocked_total").increment(1);
        match retry_after.and_then(|d| Duration::from_std(d).ok()) {
            Some(pause) if pause > Duration::zero() => {
                tracing::warn!(target: "acquire", pause_secs = pause.num_seconds(), "upstream blocked; pausing");
                self.pause_for(pause, now);
            }
            _ => {
                tracing::warn!(
                    target: "acquire",
                    dropped = self.state.remaining,
                    "upstream blocked without retry delay; treating epoch as exhausted"
                );
                self.state.remaining = 0;
                gauge!("quota_remaining").set(0.0);
            }
        }
    }

    fn pause_for(&mut self, pause: Duration, now: DateTime<Utc>) {
        let until = now + pause;
        // Never shorten a pause already in force.
        self.state.paused_until = Some(match self.state.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn remaining(&self) -> u32 {
        self.state.remaining
    }

    pub fn exhausted_flagged(&self) -> bool {
        self.exhausted_flagged
    }

    pub fn snapshot(&self) -> QuotaState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn policy(ceiling: u32) -> QuotaPolicy {
        QuotaPolicy::new(ceiling, 200, 300)
    }

    #[test]
    fn rate_limited_at_last_request_pauses_without_exhausting() {
        let now = t0();
        let mut g = Governor::restore(
            policy(100_000),
            QuotaState {
                remaining: 201,
                epoch_start: now,
                paused_until: None,
            },
            now,
        );
        assert_eq!(g.remaining(), 1);
        assert_eq!(g.evaluate(now), GovernorStatus::Active);

        g.consume();
        g.on_rate_limited(Some(std::time::Duration::from_secs(30)), now);
        assert_eq!(g.remaining(), 0);
        assert_eq!(g.evaluate(now + Duration::seconds(1)), GovernorStatus::Paused);
        assert!(!g.exhausted_flagged());

        // pause over, budget still empty
        assert_eq!(
            g.evaluate(now + Duration::seconds(31)),
            GovernorStatus::Exhausted
        );
        assert!(g.exhausted_flagged());
    }

    #[test]
    fn rate_limited_without_delay_uses_default_pause() {
        let now = t0();
        let mut g = Governor::fresh(policy(10), now);
        g.on_rate_limited(None, now);
        assert_eq!(g.status(now + Duration::seconds(299)), GovernorStatus::Paused);
        assert_eq!(g.status(now + Duration::seconds(300)), GovernorStatus::Active);
    }

    #[test]
    fn blocked_without_delay_zeroes_the_epoch() {
        let now = t0();
        let mut g = Governor::fresh(policy(10), now);
        g.on_blocked(None, now);
        assert_eq!(g.remaining(), 0);
        assert_eq!(g.evaluate(now), GovernorStatus::Exhausted);

        let next = now + Duration::hours(24);
        assert_eq!(g.evaluate(next), GovernorStatus::Active);
        assert_eq!(g.remaining(), 10);
        assert!(!g.exhausted_flagged());
    }

    #[test]
    fn blocked_with_delay_pauses_only() {
        let now = t0();
        let mut g = Governor::fresh(policy(10), now);
        g.on_blocked(Some(std::time::Duration::from_secs(60)), now);
        assert_eq!(g.remaining(), 10);
        assert_eq!(g.status(now), GovernorStatus::Paused);
    }

    #[test]
    fn shorter_pause_does_not_shorten_existing_one() {
        let now = t0();
        let mut g = Governor::fresh(policy(10), now);
        g.on_rate_limited(Some(std::time::Duration::from_secs(600)), now);
        g.on_rate_limited(Some(std::time::Duration::from_secs(5)), now);
        assert_eq!(g.status(now + Duration::seconds(60)), GovernorStatus::Paused);
    }

    #[test]
    fn restore_rolls_a_stale_epoch_and_aligns_to_saved_start() {
        let start = t0();
        let saved = QuotaState {
            remaining: 50,
            epoch_start: start,
            paused_until: None,
        };
        let g = Governor::restore(policy(1_000), saved.clone(), start + Duration::hours(23));
        assert_eq!(g.remaining(), 0, "margin of 200 floors at zero");
        assert_eq!(g.next_rollover(), start + Duration::hours(24));

        let g = Governor::restore(policy(1_000), saved, start + Duration::hours(25));
        assert_eq!(g.remaining(), 1_000);
        assert_eq!(
            g.next_rollover(),
            start + Duration::hours(25) + Duration::hours(24)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Consume,
        RateLimited(u64),
        Blocked(Option<u64>),
        Advance(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Consume),
            1 => (1u64..600).prop_map(Op::RateLimited),
            1 => prop::option::of(1u64..600).prop_map(Op::Blocked),
            2 => (1i64..40_000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn remaining_only_rises_at_rollover(ops in prop::collection::vec(op(), 1..200)) {
            let mut now = t0();
            let mut g = Governor::fresh(policy(25), now);
            for op in ops {
                let before = g.remaining();
                let mut rolled = false;
                match op {
                    Op::Consume => g.consume(),
                    Op::RateLimited(s) => g.on_rate_limited(Some(std::time::Duration::from_secs(s)), now),
                    Op::Blocked(s) => g.on_blocked(s.map(std::time::Duration::from_secs), now),
                    Op::Advance(s) => {
                        now += Duration::seconds(s);
                        rolled = g.roll_if_due(now);
                    }
                }
                if rolled {
                    prop_assert_eq!(g.remaining(), 25);
                } else {
                    prop_assert!(g.remaining() <= before);
                }
            }
        }
    }
}

//! # Rate Gate
//! System-wide pacing of outbound upstream calls: at most `max_requests` dispatches in any
//! window of `interval`. Waiting calls are admitted by priority, then arrival order.
//! Nothing is dropped, only delayed, and the call's own result is handed back untouched.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Admission priorities used across the crate. Higher goes first.
pub mod priority {
    pub const DIRECT: i32 = 2;
    pub const OVERLAY: i32 = 1;
    pub const ROUND_ROBIN: i32 = 0;
    pub const CATALOG: i32 = -1;
}

/// A caller waiting for its turn.
#[derive(Debug)]
struct Ticket {
    priority: i32,
    sequence: u64, // for stable ordering of same priority
    grant: oneshot::Sender<()>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateGate {
    tx: mpsc::UnboundedSender<Ticket>,
    sequence: Arc<AtomicU64>,
}

impl RateGate {
    /// Start the pacing task. `max_requests` of 0 is treated as 1.
    pub fn spawn(max_requests: u32, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pace(rx, max_requests.max(1) as usize, interval));
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A gate whose pacer has already stopped; every dispatch fails.
    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for admission, then run `thunk` and return its output as is.
    pub async fn dispatch<F, Fut, T>(&self, priority: i32, thunk: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (grant, granted) = oneshot::channel();
        let ticket = Ticket {
            priority,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            grant,
        };
        self.tx
            .send(ticket)
            .map_err(|_| anyhow!("rate gate is closed"))?;
        granted.await.context("rate gate dropped a waiting call")?;
        Ok(thunk().await)
    }
}

/// Admission loop. Keeps the dispatch instants of the current window; when the window is
/// full it sleeps until the oldest one ages out.
async fn pace(mut rx: mpsc::UnboundedReceiver<Ticket>, max: usize, interval: Duration) {
    let mut waiting: BinaryHeap<Ticket> = BinaryHeap::new();
    let mut window: VecDeque<Instant> = VecDeque::with_capacity(max);

    loop {
        if waiting.is_empty() {
            match rx.recv().await {
                Some(t) => waiting.push(t),
                None => break,
            }
        }

        while window.len() >= max {
            let Some(&oldest) = window.front() else { break };
            tokio::time::sleep_until(oldest + interval).await;
            window.pop_front();
        }

        // Late arrivals compete on priority with whoever was already waiting.
        while let Ok(t) = rx.try_recv() {
            waiting.push(t);
        }

        while let Some(t) = waiting.pop() {
            // A caller that gave up does not consume a slot.
            if t.grant.send(()).is_ok() {
                window.push_back(Instant::now());
                break;
            }
        }
    }
    tracing::debug!(target: "acquire", "rate gate pacer stopped");
}

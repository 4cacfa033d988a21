//! # Checkpoint
//! Periodic durable snapshot of all mutable scheduler state, one record per section, and
//! the startup path that rehydrates from it.
//!
//! The writer only ever sees owned copies handed out by the acquisition loop; it never
//! touches live state. Writes go through [`WriteQueue`] so at most one is in flight.

pub mod queue;
pub mod store;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::acquire::cursor::CursorState;
use crate::acquire::governor::QuotaState;
use crate::acquire::SchedulerHandle;
use crate::store::HintMap;
use crate::upstream::{Event, ItemId};

pub use queue::WriteQueue;
pub use store::{DurableStore, FileStore, MemoryStore};

pub mod section {
    pub const EVENTS: &str = "events";
    pub const ERRORS: &str = "errors";
    pub const CURSOR: &str = "cursor";
    pub const HINTS: &str = "hints";
    pub const QUOTA: &str = "quota";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub events: HashMap<ItemId, Vec<Event>>,
    pub errors: BTreeSet<ItemId>,
    pub cursor: CursorState,
    pub hints: HintMap,
    /// `None` on first-ever start.
    pub quota: Option<QuotaState>,
}

/// A checkpoint plus what the writer needs to decide whether to bother.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    pub revision: u64,
    pub exhausted: bool,
    pub checkpoint: Checkpoint,
}

impl Checkpoint {
    pub fn sections(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        Ok(vec![
            (section::EVENTS, serde_json::to_vec(&self.events)?),
            (section::ERRORS, serde_json::to_vec(&self.errors)?),
            (section::CURSOR, serde_json::to_vec(&self.cursor)?),
            (section::HINTS, serde_json::to_vec(&self.hints)?),
            (section::QUOTA, serde_json::to_vec(&self.quota)?),
        ])
    }

    /// Read every section. Absent sections are empty defaults; unreadable or corrupt ones
    /// are logged and treated as absent.
    pub async fn load(store: &dyn DurableStore) -> Self {
        Self {
            events: load_section(store, section::EVENTS).await.unwrap_or_default(),
            errors: load_section(store, section::ERRORS).await.unwrap_or_default(),
            cursor: load_section(store, section::CURSOR).await.unwrap_or_default(),
            hints: load_section(store, section::HINTS).await.unwrap_or_default(),
            quota: load_section::<Option<QuotaState>>(store, section::QUOTA)
                .await
                .flatten(),
        }
    }
}

async fn load_section<T: DeserializeOwned>(store: &dyn DurableStore, name: &str) -> Option<T> {
    let bytes = match store.read(name).await {
        Ok(Some(b)) => b,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(target: "checkpoint", section = name, "read failed: {e:#}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(target: "checkpoint", section = name, error = %e, "corrupt section ignored");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReport {
    /// Exhausted and unchanged since the last complete write.
    Skipped,
    Written { failed: usize },
}

#[derive(Debug)]
pub struct CheckpointWriter {
    queue: WriteQueue,
    /// Revision and exhaustion of the last checkpoint that was fully written.
    last_complete: Option<(u64, bool)>,
}

impl CheckpointWriter {
    pub fn new(queue: WriteQueue) -> Self {
        Self {
            queue,
            last_complete: None,
        }
    }

    /// Periodic entry point: skips the write when the governor is exhausted and nothing
    /// changed since the last complete exhausted write.
    pub async fn write_if_needed(&mut self, snap: &CheckpointSnapshot) -> WriteReport {
        if snap.exhausted && self.last_complete == Some((snap.revision, true)) {
            counter!("checkpoint_skipped_total").increment(1);
            tracing::trace!(target: "checkpoint", revision = snap.revision, "exhausted and unchanged; skipping");
            return WriteReport::Skipped;
        }
        WriteReport::Written {
            failed: self.write(snap).await,
        }
    }

    /// Unconditional write of every section. Returns the number of failed sections.
    pub async fn write(&mut self, snap: &CheckpointSnapshot) -> usize {
        let sections = match snap.checkpoint.sections() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "checkpoint", "serialising checkpoint failed: {e:#}");
                counter!("checkpoint_write_errors_total").increment(1);
                return 1;
            }
        };

        let mut failed = 0;
        for (name, bytes) in sections {
            match self.queue.write(name, bytes).await {
                Ok(()) => counter!("checkpoint_writes_total").increment(1),
                Err(e) => {
                    failed += 1;
                    counter!("checkpoint_write_errors_total").increment(1);
                    tracing::warn!(target: "checkpoint", section = name, "write failed: {e:#}");
                }
            }
        }

        if failed == 0 {
            self.last_complete = Some((snap.revision, snap.exhausted));
        }
        tracing::debug!(target: "checkpoint", revision = snap.revision, failed, "checkpoint written");
        failed
    }
}

/// Snapshot-and-write every `period` until `stop` flips. Hands the writer back so the
/// caller can flush the final checkpoint through the same queue.
pub fn spawn_periodic(
    scheduler: SchedulerHandle,
    mut writer: CheckpointWriter,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<CheckpointWriter> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately; nothing worth writing yet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match scheduler.checkpoint().await {
                        Ok(snap) => {
                            writer.write_if_needed(&snap).await;
                        }
                        Err(e) => {
                            tracing::warn!(target: "checkpoint", "no snapshot this period: {e:#}");
                        }
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        writer
    })
}

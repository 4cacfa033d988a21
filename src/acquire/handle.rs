// src/acquire/handle.rs
//! Command channel into the acquisition loop. Every outside caller (HTTP routes, the
//! checkpoint timer, catalog refresh) talks to the loop through [`SchedulerHandle`]; the
//! loop answers with owned copies, never references into its state.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::acquire::governor::GovernorStatus;
use crate::acquire::Scheduler;
use crate::checkpoint::CheckpointSnapshot;
use crate::fanout::LiveFanout;
use crate::upstream::{CatalogItem, Event, ItemId};

const COMMAND_BUFFER: usize = 256;

/// Cached view of one item, as served to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    pub item_id: ItemId,
    pub events: Vec<Event>,
    pub newest: Option<i64>,
    pub hinted_at: Option<i64>,
    pub errored: bool,
    /// A possibly-changed hint is newer than what we hold, so a direct fetch was queued.
    pub recheck_queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub status: GovernorStatus,
    pub remaining: u32,
    pub epoch_start: DateTime<Utc>,
    pub next_rollover: DateTime<Utc>,
    pub paused_until: Option<DateTime<Utc>>,
    pub cursor: usize,
    pub current_item: Option<ItemId>,
    pub catalog_size: usize,
    pub errored: usize,
    pub overlay: usize,
    pub direct_pending: usize,
    pub stored_items: usize,
    pub stored_events: usize,
    pub hints: usize,
    pub revision: u64,
}

enum Command {
    RequestNow(ItemId),
    Enqueue(ItemId, u64),
    PushHint(Vec<ItemId>),
    ReplaceCatalog(Vec<CatalogItem>),
    Item(ItemId, oneshot::Sender<ItemView>),
    EventsFor(Vec<ItemId>, oneshot::Sender<Vec<(ItemId, Vec<Event>)>>),
    Status(oneshot::Sender<StatusView>),
    Checkpoint(oneshot::Sender<CheckpointSnapshot>),
    Shutdown(oneshot::Sender<CheckpointSnapshot>),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    fanout: LiveFanout,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SchedulerHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("acquisition loop has stopped"))
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.context("acquisition loop dropped the request")
    }

    pub fn fanout(&self) -> &LiveFanout {
        &self.fanout
    }

    pub async fn request_now(&self, item: ItemId) -> Result<()> {
        self.send(Command::RequestNow(item)).await
    }

    pub async fn enqueue(&self, item: ItemId, weight: u64) -> Result<()> {
        self.send(Command::Enqueue(item, weight)).await
    }

    pub async fn push_hint(&self, items: Vec<ItemId>) -> Result<()> {
        self.send(Command::PushHint(items)).await
    }

    pub async fn replace_catalog(&self, catalog: Vec<CatalogItem>) -> Result<()> {
        self.send(Command::ReplaceCatalog(catalog)).await
    }

    /// Cached events for `item`; queues a direct re-check when the hint map says so.
    pub async fn item(&self, item: ItemId) -> Result<ItemView> {
        self.ask(|tx| Command::Item(item, tx)).await
    }

    /// Stored lists for the given ids, in request order. Unknown ids come back empty.
    pub async fn events_for(&self, items: Vec<ItemId>) -> Result<Vec<(ItemId, Vec<Event>)>> {
        self.ask(|tx| Command::EventsFor(items, tx)).await
    }

    pub async fn status(&self) -> Result<StatusView> {
        self.ask(Command::Status).await
    }

    pub async fn checkpoint(&self) -> Result<CheckpointSnapshot> {
        self.ask(Command::Checkpoint).await
    }

    /// Stop ticking. Returns the state as it was when the loop exited.
    pub async fn shutdown(&self) -> Result<CheckpointSnapshot> {
        self.ask(Command::Shutdown).await
    }
}

impl Scheduler {
    /// Move the scheduler onto its own task and start ticking.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let fanout = self.fanout.clone();
        tokio::spawn(self.run(rx));
        SchedulerHandle { tx, fanout }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        // first tick one period in, after the startup catalog refresh had its chance
        let mut ticker = time::interval_at(Instant::now() + self.tick_period, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            target: "acquire",
            period_ms = self.tick_period.as_millis() as u64,
            upstream = self.upstream.name(),
            "acquisition loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick(Utc::now()).await;
                    tracing::trace!(target: "acquire", ?outcome);
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.state.snapshot(Utc::now()));
                        break;
                    }
                    Some(cmd) => self.handle(cmd, Utc::now()),
                    None => break,
                },
            }
        }
        tracing::info!(target: "acquire", "acquisition loop stopped");
    }

    fn handle(&mut self, cmd: Command, now: DateTime<Utc>) {
        // Reply send errors only mean the caller went away.
        match cmd {
            Command::RequestNow(item) => self.request_now(item),
            Command::Enqueue(item, weight) => self.enqueue(item, weight),
            Command::PushHint(items) => self.push_hint(items, now),
            Command::ReplaceCatalog(catalog) => self.replace_catalog(catalog),
            Command::Item(item, reply) => {
                let _ = reply.send(self.item_view(item));
            }
            Command::EventsFor(items, reply) => {
                let lists = items
                    .into_iter()
                    .map(|id| {
                        let events = self.state.store.events(id).unwrap_or_default().to_vec();
                        (id, events)
                    })
                    .collect();
                let _ = reply.send(lists);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status_view(now));
            }
            Command::Checkpoint(reply) => {
                let _ = reply.send(self.state.snapshot(now));
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(self.state.snapshot(now));
            }
        }
    }

    pub(super) fn item_view(&mut self, item: ItemId) -> ItemView {
        let recheck_queued = self.state.store.possibly_stale(&self.state.hints, item);
        if recheck_queued {
            tracing::debug!(target: "acquire", item, "hint newer than stored events; queuing re-check");
            self.request_now(item);
        }
        ItemView {
            item_id: item,
            events: self.state.store.events(item).unwrap_or_default().to_vec(),
            newest: self.state.store.newest(item),
            hinted_at: self.state.hints.get(item),
            errored: self.state.cursor.is_errored(item),
            recheck_queued,
        }
    }

    fn status_view(&self, now: DateTime<Utc>) -> StatusView {
        let quota = self.state.governor.snapshot();
        StatusView {
            status: self.state.governor.status(now),
            remaining: quota.remaining,
            epoch_start: quota.epoch_start,
            next_rollover: self.state.governor.next_rollover(),
            paused_until: quota.paused_until,
            cursor: self.state.cursor.index(),
            current_item: self.state.cursor.current().map(|it| it.id),
            catalog_size: self.state.cursor.catalog().len(),
            errored: self.state.cursor.errored().len(),
            overlay: self.state.overlay.len(),
            direct_pending: self.state.direct.len(),
            stored_items: self.state.store.len(),
            stored_events: self.state.store.total_events(),
            hints: self.state.hints.len(),
            revision: self.state.revision,
        }
    }
}

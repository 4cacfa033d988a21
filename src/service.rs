// src/service.rs
//! Wires the acquisition loop, the periodic checkpoint writer and the catalog refresh into one
//! running unit, and owns the stop-then-flush shutdown sequence.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::acquire::refresh::spawn_catalog_refresh;
use crate::acquire::{RateGate, Scheduler, SchedulerHandle, SchedulerState};
use crate::api::AppState;
use crate::checkpoint::{self, Checkpoint, CheckpointWriter, DurableStore, WriteQueue};
use crate::config::SchedulerConfig;
use crate::fanout::LiveFanout;
use crate::upstream::Upstream;

pub struct Service {
    scheduler: SchedulerHandle,
    stop: watch::Sender<bool>,
    checkpoint_task: JoinHandle<CheckpointWriter>,
    refresh_task: JoinHandle<()>,
    merge_threshold: usize,
}

impl Service {
    /// Rehydrate from `store` and start every background task.
    pub async fn start(
        cfg: SchedulerConfig,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let cfg = cfg.sanitized();
        let saved = Checkpoint::load(store.as_ref()).await;
        let state = SchedulerState::from_checkpoint(saved, &cfg, Utc::now());
        tracing::info!(
            target: "checkpoint",
            items = state.store.len(),
            errored = state.cursor.errored().len(),
            catalog = state.cursor.catalog().len(),
            remaining = state.governor.remaining(),
            "scheduler state restored"
        );

        let gate = RateGate::spawn(cfg.gate_max_requests, cfg.gate_interval());
        let fanout = LiveFanout::new(cfg.fanout_capacity);
        let scheduler = Scheduler::new(
            state,
            Arc::clone(&upstream),
            gate.clone(),
            fanout,
            cfg.tick(),
        )
        .spawn();

        let (stop, stop_rx) = watch::channel(false);
        let writer = CheckpointWriter::new(WriteQueue::spawn(store));
        let checkpoint_task = checkpoint::spawn_periodic(
            scheduler.clone(),
            writer,
            cfg.checkpoint_period(),
            stop_rx,
        );
        let refresh_task = spawn_catalog_refresh(
            upstream,
            gate,
            scheduler.clone(),
            cfg.catalog_refresh_period(),
        );

        Self {
            scheduler,
            stop,
            checkpoint_task,
            refresh_task,
            merge_threshold: cfg.merge_parallel_threshold,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            scheduler: self.scheduler.clone(),
            merge_threshold: self.merge_threshold,
        }
    }

    /// Stop ticking and flush one final checkpoint. Returns the number of sections that
    /// failed to write.
    pub async fn shutdown(self) -> Result<usize> {
        let _ = self.stop.send(true);
        self.refresh_task.abort();
        let mut writer = self
            .checkpoint_task
            .await
            .context("checkpoint task did not finish cleanly")?;
        let last = self.scheduler.shutdown().await?;
        let failed = writer.write(&last).await;
        tracing::info!(target: "checkpoint", revision = last.revision, failed, "final checkpoint flushed");
        Ok(failed)
    }
}

// src/acquire/refresh.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::acquire::gate::{priority, RateGate};
use crate::acquire::SchedulerHandle;
use crate::upstream::{clean_catalog, Upstream};

/// Fetch, clean and hand over the catalog. Goes through the gate at the lowest priority and
/// is not charged against the daily quota. An empty listing keeps the current catalog.
pub async fn refresh_once(
    upstream: &Arc<dyn Upstream>,
    gate: &RateGate,
    scheduler: &SchedulerHandle,
) -> Result<usize> {
    let up = Arc::clone(upstream);
    let raw = gate
        .dispatch(priority::CATALOG, move || async move { up.fetch_catalog().await })
        .await??;
    let fetched = raw.len();
    let catalog = clean_catalog(raw);
    if catalog.is_empty() {
        tracing::warn!(target: "upstream", fetched, "catalog listing came back empty; keeping current one");
        return Ok(0);
    }
    let kept = catalog.len();
    scheduler.replace_catalog(catalog).await?;
    tracing::info!(target: "upstream", fetched, kept, "catalog refreshed");
    Ok(kept)
}

/// Refresh now, then every `period`. Failures are logged and retried next period.
pub fn spawn_catalog_refresh(
    upstream: Arc<dyn Upstream>,
    gate: RateGate,
    scheduler: SchedulerHandle,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_once(&upstream, &gate, &scheduler).await {
                tracing::warn!(target: "upstream", "catalog refresh failed: {e:#}");
            }
        }
    })
}

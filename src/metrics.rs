use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Register help texts for every metric the scheduler emits. Idempotent.
pub fn ensure_metrics_described() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("acquire_ticks_total", "Acquisition loop ticks");
        describe_counter!("upstream_calls_total", "Per-item upstream calls, by target source");
        describe_counter!("upstream_rate_limited_total", "Rate-limit answers from upstream");
        describe_counter!("upstream_blocked_total", "Block answers from upstream");
        describe_counter!("upstream_failures_total", "Not-found and other permanent item failures");
        describe_counter!("upstream_decode_errors_total", "Upstream bodies that failed to decode");
        describe_counter!("quota_exhausted_total", "Epochs that ran out of quota");
        describe_counter!("store_commits_total", "Event lists replaced by newer data");
        describe_gauge!("quota_remaining", "Requests left in the current epoch");
        describe_counter!("checkpoint_writes_total", "Checkpoint sections written");
        describe_counter!("checkpoint_write_errors_total", "Checkpoint sections that failed to write");
        describe_counter!("checkpoint_skipped_total", "Periods skipped on unchanged exhausted state");
        describe_histogram!("upstream_fetch_ms", "Upstream per-item call latency in milliseconds");
        describe_histogram!("merge_duration_ms", "Aggregation merge duration in milliseconds");
    });
}

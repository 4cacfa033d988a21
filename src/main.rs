//! catalog-watch: binary entrypoint.
//! Loads config, rehydrates the scheduler from its checkpoint and serves the HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use catalog_watch::checkpoint::{DurableStore, FileStore};
use catalog_watch::metrics::Metrics;
use catalog_watch::upstream::providers::{fixture::FixtureUpstream, http::HttpUpstream};
use catalog_watch::upstream::Upstream;
use catalog_watch::{router, SchedulerConfig, Service};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default; `CW_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("catalog_watch=info,warn"));
    let json = std::env::var("CW_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    // try_init: the shuttle runtime may already have installed a subscriber
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

fn build_upstream(cfg: &SchedulerConfig) -> anyhow::Result<Arc<dyn Upstream>> {
    match cfg.upstream_base_url.as_deref() {
        Some(base) => Ok(Arc::new(HttpUpstream::new(base)?)),
        None => {
            tracing::warn!("no upstream_base_url configured; running against the empty fixture provider");
            Ok(Arc::new(FixtureUpstream::new(Vec::new())))
        }
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = SchedulerConfig::load_default().context("load scheduler config")?;

    let metrics = Metrics::init()?;
    let upstream = build_upstream(&cfg)?;
    let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(&cfg.state_dir));

    let service = Service::start(cfg, upstream, store).await;
    let app = router(service.app_state()).merge(metrics.router());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("shutdown requested; flushing final checkpoint");
        match service.shutdown().await {
            Ok(0) => {}
            Ok(failed) => tracing::warn!(failed, "final checkpoint incomplete"),
            Err(e) => tracing::warn!(error = ?e, "shutdown failed"),
        }
    });

    Ok(app.into())
}

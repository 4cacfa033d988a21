// src/upstream/types.rs
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Opaque catalog identifier as issued by the upstream provider.
pub type ItemId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: ItemId,
    pub name: String, // informational only
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub timestamp: i64, // unix seconds
    pub body: String,
}

/// Result of a single per-item query. Each variant is routed differently by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Events, newest first.
    Success(Vec<Event>),
    RateLimited { retry_after: Option<Duration> },
    Blocked { retry_after: Option<Duration> },
    /// Not found or any other non-retryable status. `status == 0` means transport error.
    Failure { status: u16 },
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::RateLimited { .. } => "rate_limited",
            FetchOutcome::Blocked { .. } => "blocked",
            FetchOutcome::Failure { .. } => "failure",
        }
    }
}

#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_events(&self, item: ItemId) -> FetchOutcome;
    /// Raw catalog listing; callers run it through [`clean_catalog`].
    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>>;
    fn name(&self) -> &'static str;
}

/// Drop blank names, keep the first occurrence of each id, preserve order.
pub fn clean_catalog(items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    use std::collections::HashSet;
    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for mut it in items {
        let name = it.name.trim();
        if name.is_empty() || !seen.insert(it.id) {
            continue;
        }
        it.name = name.to_string();
        out.push(it);
    }
    out
}

/// Sort newest first. Stable, so equal timestamps keep provider order.
pub fn newest_first(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    events
}

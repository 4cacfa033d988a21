use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::upstream::types::{CatalogItem, FetchOutcome, ItemId, Upstream};

/// In-memory provider with scripted per-item outcomes. Used by tests and for local runs
/// without a real upstream.
pub struct FixtureUpstream {
    catalog: Mutex<Vec<CatalogItem>>,
    scripted: Mutex<HashMap<ItemId, VecDeque<FetchOutcome>>>,
    fallback: FetchOutcome,
    calls: Mutex<Vec<ItemId>>,
}

impl FixtureUpstream {
    pub fn new(catalog: Vec<CatalogItem>) -> Self {
        Self {
            catalog: Mutex::new(catalog),
            scripted: Mutex::new(HashMap::new()),
            fallback: FetchOutcome::Success(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Outcome returned once an item's script runs dry.
    pub fn with_fallback(mut self, outcome: FetchOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Queue `outcome` as the next answer for `item`.
    pub fn script(&self, item: ItemId, outcome: FetchOutcome) {
        self.scripted
            .lock()
            .expect("fixture script mutex poisoned")
            .entry(item)
            .or_default()
            .push_back(outcome);
    }

    pub fn set_catalog(&self, catalog: Vec<CatalogItem>) {
        *self.catalog.lock().expect("fixture catalog mutex poisoned") = catalog;
    }

    /// Every item queried so far, in call order.
    pub fn calls(&self) -> Vec<ItemId> {
        self.calls.lock().expect("fixture calls mutex poisoned").clone()
    }
}

#[async_trait]
impl Upstream for FixtureUpstream {
    async fn fetch_events(&self, item: ItemId) -> FetchOutcome {
        self.calls
            .lock()
            .expect("fixture calls mutex poisoned")
            .push(item);
        let next = self
            .scripted
            .lock()
            .expect("fixture script mutex poisoned")
            .get_mut(&item)
            .and_then(|q| q.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>> {
        Ok(self
            .catalog
            .lock()
            .expect("fixture catalog mutex poisoned")
            .clone())
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

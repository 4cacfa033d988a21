//! Round-robin index over the catalog snapshot, plus the permanent-error set it skips.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::upstream::{CatalogItem, ItemId};

#[derive(Debug, Clone, Default)]
pub struct ScanCursor {
    catalog: Vec<CatalogItem>,
    index: usize,
    errored: BTreeSet<ItemId>,
}

/// Persisted cursor position (the `cursor` checkpoint section). The id lets a restart land
/// on the same item even if the catalog was reordered in between.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub index: usize,
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub catalog: Vec<CatalogItem>,
}

impl ScanCursor {
    pub fn new(catalog: Vec<CatalogItem>) -> Self {
        Self {
            catalog,
            index: 0,
            errored: BTreeSet::new(),
        }
    }

    pub fn restore(state: CursorState, errored: BTreeSet<ItemId>) -> Self {
        let mut c = Self {
            catalog: Vec::new(),
            index: state.index,
            errored,
        };
        c.replace_catalog_at(state.catalog, state.item_id);
        c
    }

    pub fn current(&self) -> Option<&CatalogItem> {
        self.catalog.get(self.index)
    }

    /// Step forward, wrapping to 0 at the end of the catalog.
    pub fn advance(&mut self) {
        if self.catalog.is_empty() {
            self.index = 0;
            return;
        }
        self.index += 1;
        if self.index >= self.catalog.len() {
            self.index = 0;
        }
    }

    /// Next round-robin target, stepping over errored items (each step advances the cursor).
    /// Inspects at most one full lap; `None` if the catalog is empty or fully errored.
    pub fn next_target(&mut self) -> Option<ItemId> {
        for _ in 0..self.catalog.len() {
            let id = self.catalog[self.index].id;
            if !self.errored.contains(&id) {
                return Some(id);
            }
            tracing::trace!(target: "acquire", item = id, "skipping errored item");
            self.advance();
        }
        None
    }

    /// Swap in a fresh catalog, staying on the current item if it is still listed.
    pub fn replace_catalog(&mut self, catalog: Vec<CatalogItem>) {
        let anchor = self.current().map(|it| it.id);
        self.replace_catalog_at(catalog, anchor);
    }

    fn replace_catalog_at(&mut self, catalog: Vec<CatalogItem>, anchor: Option<ItemId>) {
        self.catalog = catalog;
        if let Some(pos) = anchor.and_then(|id| self.catalog.iter().position(|it| it.id == id)) {
            self.index = pos;
        } else if self.index >= self.catalog.len() {
            self.index = 0;
        }
    }

    pub fn mark_errored(&mut self, id: ItemId) -> bool {
        self.errored.insert(id)
    }

    /// Forget a permanent error after the item answered successfully on demand.
    pub fn clear_errored(&mut self, id: ItemId) -> bool {
        self.errored.remove(&id)
    }

    pub fn is_errored(&self, id: ItemId) -> bool {
        self.errored.contains(&id)
    }

    pub fn errored(&self) -> &BTreeSet<ItemId> {
        &self.errored
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn catalog(&self) -> &[CatalogItem] {
        &self.catalog
    }

    pub fn state(&self) -> CursorState {
        CursorState {
            index: self.index,
            item_id: self.current().map(|it| it.id),
            catalog: self.catalog.clone(),
        }
    }
}

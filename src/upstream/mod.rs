// src/upstream/mod.rs
pub mod providers;
pub mod types;

pub use types::{clean_catalog, newest_first, CatalogItem, Event, FetchOutcome, ItemId, Upstream};

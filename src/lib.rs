// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod acquire;
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod fanout;
pub mod merge;
pub mod metrics;
pub mod service;
pub mod store;
pub mod upstream;

// ---- Re-exports for stable public API ----
pub use crate::acquire::{Scheduler, SchedulerHandle, SchedulerState};
pub use crate::api::{router, AppState};
pub use crate::config::SchedulerConfig;
pub use crate::service::Service;

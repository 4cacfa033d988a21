// src/config/mod.rs
pub mod scheduler;

pub use scheduler::SchedulerConfig;

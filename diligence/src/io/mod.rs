//! Side-effecting collaborators: persistence, configuration, executors.

pub mod config;
pub mod event_log;
pub mod executor;
pub mod store;

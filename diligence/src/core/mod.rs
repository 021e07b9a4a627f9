//! Deterministic, pure orchestration logic.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests; persistence
//! and per-job serialization live in [`crate::io`] and
//! [`crate::orchestrator`].

pub mod admission;
pub mod detector;
pub mod entity_memory;
pub mod guardrails;
pub mod queue;
pub mod recitation;
pub mod scratchpad;
pub mod summarize;
pub mod tool_policy;
pub mod triggers;
pub mod types;

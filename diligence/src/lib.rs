//! Branch orchestration for multi-branch due-diligence research.
//!
//! A job researches one entity through up to eight typed branches. Finished
//! branches can propose handoffs to new branches; an admission pass rations
//! the remaining branch slots by priority. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (trigger detection, admission,
//!   scratchpad and entity-memory merges, guardrails, prompt rendering).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (record stores, config, executors,
//!   event log). Isolated behind traits so tests can swap them.
//!
//! [`orchestrator`] coordinates core logic with I/O, serializing every
//! read-modify-write per job and per entity through [`locks`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod locks;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

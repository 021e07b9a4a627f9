//! Diagnostic tracing for the `diligence` binary.
//!
//! Spans and events from the orchestrator (job and branch ids, admission
//! counts, compaction) go to stderr, filtered by `RUST_LOG`. They are never
//! persisted. The record of what a job did lives in its event log
//! (`io::event_log`, `<state-dir>/jobs/<job_id>/events.jsonl`), which is
//! written whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber. Call once, from `main`.
///
/// ```bash
/// RUST_LOG=diligence=debug diligence run --entity "Acme Corp" --fixtures fixtures/
/// ```
pub fn init() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(env_filter(directives.as_deref()))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

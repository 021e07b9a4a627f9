//! Per-job audit trail records (`jobs/<job_id>/events.jsonl`).
//!
//! One JSON object per line, appended in the order events happen. The log is
//! product output; tracing is for diagnostics only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BranchType, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        entity_name: String,
        entity_type: String,
        branches: Vec<BranchType>,
        prior_jobs: usize,
    },
    BranchStarted {
        branch: BranchType,
        attempt: u32,
        spawned_by: Option<String>,
    },
    BranchCompleted {
        branch: BranchType,
        confidence: f64,
        key_facts: usize,
        warnings: Vec<String>,
    },
    BranchFailed {
        branch: BranchType,
        error: String,
    },
    HandoffsDetected {
        from: BranchType,
        detected: usize,
        enqueued: usize,
    },
    HandoffAccepted {
        handoff_id: String,
        from: BranchType,
        to: BranchType,
        priority: Priority,
    },
    HandoffRejected {
        handoff_id: String,
        from: BranchType,
        to: BranchType,
        reason: String,
    },
    ScratchpadCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    JobFinished {
        verdict: String,
        promoted_facts: usize,
        open_questions: usize,
    },
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::JobStarted { .. } => "job_started",
            JobEvent::BranchStarted { .. } => "branch_started",
            JobEvent::BranchCompleted { .. } => "branch_completed",
            JobEvent::BranchFailed { .. } => "branch_failed",
            JobEvent::HandoffsDetected { .. } => "handoffs_detected",
            JobEvent::HandoffAccepted { .. } => "handoff_accepted",
            JobEvent::HandoffRejected { .. } => "handoff_rejected",
            JobEvent::ScratchpadCompacted { .. } => "scratchpad_compacted",
            JobEvent::JobFinished { .. } => "job_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventRecord {
    pub at: DateTime<Utc>,
    pub job_id: String,
    #[serde(flatten)]
    pub event: JobEvent,
}

impl JobEventRecord {
    pub fn new(job_id: &str, event: JobEvent, at: DateTime<Utc>) -> Self {
        Self {
            at,
            job_id: job_id.to_string(),
            event,
        }
    }
}

/// Serialize one record as a single JSONL line (with trailing newline).
pub fn to_line(record: &JobEventRecord) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Parse a JSONL document, skipping blank lines.
pub fn parse_lines(contents: &str) -> anyhow::Result<Vec<JobEventRecord>> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|err| anyhow::anyhow!("parse event line {}: {err}", idx + 1))
        })
        .collect()
}

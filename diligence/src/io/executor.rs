//! Branch executor abstraction.
//!
//! The [`BranchExecutor`] trait decouples orchestration from whatever actually
//! researches a branch (an LLM agent with search tools in production). The
//! crate ships [`FixtureExecutor`], which replays recorded outputs from disk;
//! tests use scripted executors.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{BranchOutput, BranchType, BranchUsage};

/// Everything a branch run gets from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchRequest {
    pub job_id: String,
    pub branch: BranchType,
    pub entity_name: String,
    pub entity_type: String,
    /// Rendered goal recitation, appended last to the branch instructions.
    pub recitation: String,
    /// Rendered handoff context when the branch was spawned by a handoff.
    pub handoff_context: Option<String>,
    /// Rendered entity memory from earlier jobs.
    pub prior_knowledge: Option<String>,
    /// Tool-name substrings the branch may use.
    pub allowed_tools: Vec<String>,
    pub attempt: u32,
}

/// Output plus resource usage of one branch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRun {
    #[serde(flatten)]
    pub output: BranchOutput,
    #[serde(default)]
    pub usage: BranchUsage,
}

/// Abstraction over branch research backends.
pub trait BranchExecutor: Sync {
    fn execute(&self, request: &BranchRequest) -> Result<BranchRun>;
}

/// Replays `<dir>/<branch>.json` fixtures (a serialized [`BranchRun`]).
#[derive(Debug, Clone)]
pub struct FixtureExecutor {
    dir: PathBuf,
}

impl FixtureExecutor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl BranchExecutor for FixtureExecutor {
    #[instrument(skip_all, fields(job_id = %request.job_id, branch = %request.branch))]
    fn execute(&self, request: &BranchRequest) -> Result<BranchRun> {
        let path = self.dir.join(format!("{}.json", request.branch.as_str()));
        if !path.exists() {
            return Err(anyhow!(
                "no fixture for branch {} at {}",
                request.branch,
                path.display()
            ));
        }
        debug!(path = %path.display(), "replaying fixture");
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let run: BranchRun = serde_json::from_str(&contents)
            .with_context(|| format!("parse fixture {}", path.display()))?;
        Ok(run)
    }
}

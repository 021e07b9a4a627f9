//! Test-only builders and a scripted branch executor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};

use crate::core::types::{
    BranchOutput, BranchType, BranchUsage, Handoff, HandoffContext, HandoffStatus, Priority, Source,
};
use crate::io::config::OrchestratorConfig;
use crate::io::executor::{BranchExecutor, BranchRequest, BranchRun};
use crate::io::store::FileStore;
use crate::orchestrator::Orchestrator;

/// A pending handoff with a fresh id and placeholder reason.
pub fn handoff(from: BranchType, to: BranchType, priority: Priority) -> Handoff {
    Handoff {
        id: format!("handoff_{}", uuid::Uuid::new_v4().simple()),
        from,
        to,
        reason: format!("{from} findings suggest {to} research"),
        priority,
        context: HandoffContext::default(),
        status: HandoffStatus::Pending,
        created_at: Utc::now(),
        processed_at: None,
        rejection: None,
    }
}

/// Sources with the given reliability scores.
pub fn sources(reliabilities: &[f64]) -> Vec<Source> {
    reliabilities
        .iter()
        .enumerate()
        .map(|(i, reliability)| Source {
            url: format!("https://source{i}.example.com/report"),
            title: Some(format!("Report {i}")),
            reliability: Some(*reliability),
        })
        .collect()
}

/// A run that passes output validation.
pub fn run(findings: Value, confidence: f64) -> BranchRun {
    BranchRun {
        output: BranchOutput {
            findings,
            sources: sources(&[0.9, 0.6]),
            confidence,
        },
        usage: BranchUsage {
            tool_calls: 5,
            tokens: 4_000,
            api_calls: 3,
        },
    }
}

/// Company profile findings that fire the regulated-industry, patent and
/// technical-product triggers.
pub fn fintech_profile() -> Value {
    json!({
        "summary": "Acme Corp builds payment infrastructure for marketplaces.",
        "industry": "Fintech payments",
        "foundedYear": 2019,
        "headquarters": "Berlin",
        "productType": "API platform",
        "patents": ["US1234567"]
    })
}

/// Findings that fire no trigger for any branch.
pub fn quiet_findings() -> Value {
    json!({ "summary": "Nothing notable.", "notes": "No further leads." })
}

/// Executor returning scripted results per branch and recording every call.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    results: HashMap<BranchType, std::result::Result<BranchRun, String>>,
    calls: Mutex<Vec<BranchRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, branch: BranchType, run: BranchRun) -> Self {
        self.results.insert(branch, Ok(run));
        self
    }

    pub fn failing(mut self, branch: BranchType, error: &str) -> Self {
        self.results.insert(branch, Err(error.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<BranchRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn called_branches(&self) -> Vec<BranchType> {
        let mut branches: Vec<BranchType> = self.calls().iter().map(|call| call.branch).collect();
        branches.sort();
        branches
    }
}

impl BranchExecutor for ScriptedExecutor {
    fn execute(&self, request: &BranchRequest) -> Result<BranchRun> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        match self.results.get(&request.branch) {
            Some(Ok(run)) => Ok(run.clone()),
            Some(Err(error)) => Err(anyhow!("{error}")),
            None => Ok(run(quiet_findings(), 0.5)),
        }
    }
}

/// Temporary state directory with a fixtures folder for file-backed tests.
pub struct TestState {
    temp: tempfile::TempDir,
}

impl TestState {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp state dir")?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.temp.path().join("fixtures")
    }

    pub fn orchestrator(&self) -> Orchestrator<FileStore> {
        Orchestrator::new(FileStore::new(self.path()), OrchestratorConfig::default())
    }

    /// Write `run` as the fixture replayed for `branch`.
    pub fn write_fixture(&self, branch: BranchType, run: &BranchRun) -> Result<PathBuf> {
        let dir = self.fixtures_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{}.json", branch.as_str()));
        let json = serde_json::to_string_pretty(run).context("serialize fixture")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

//! Per-job shared working memory.
//!
//! Every branch reads the scratchpad before it runs and writes a compact
//! summary into it when it finishes. Raw findings never land here; see
//! [`crate::core::summarize`]. All mutations are plain methods on the record;
//! persistence and per-job serialization belong to the caller.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BranchStatus, BranchType, BranchUsage};

/// Oldest entries are evicted beyond this many failed approaches.
pub const MAX_FAILED_APPROACHES: usize = 20;
/// Oldest entries are evicted beyond this many working notes.
pub const MAX_WORKING_NOTES: usize = 30;
/// Key facts kept per summary once compaction starts trimming.
pub const COMPACTED_KEY_FACTS: usize = 4;

pub const GLOBAL_GOALS: [&str; 4] = [
    "Research the entity thoroughly across every assigned branch",
    "Verify claims against independent, citable sources",
    "Surface gaps and contradictions between branches",
    "Produce findings that support a concise investment memo",
];

pub const TODO_CROSS_CHECK: &str = "Cross-check contradictions across branches";
pub const TODO_SYNTHESIZE: &str = "Synthesize the due-diligence memo";

/// Job-level phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Researching,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub branch: Option<BranchType>,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchProgress {
    pub status: BranchStatus,
    pub attempts: u32,
    pub tool_calls: u32,
    pub tokens_used: u64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the branch was spawned through a handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
}

impl BranchProgress {
    fn pending(spawned_by: Option<String>) -> Self {
        Self {
            status: BranchStatus::Pending,
            attempts: 0,
            tool_calls: 0,
            tokens_used: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            spawned_by,
        }
    }

    /// True for branches that hold (or held) one of the job's branch slots.
    pub fn counts_against_budget(&self) -> bool {
        self.status != BranchStatus::Skipped
    }
}

/// Fixed-size representation of one branch's findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFindingSummary {
    pub branch: BranchType,
    pub summary_text: String,
    pub key_facts: Vec<String>,
    pub confidence: f64,
    pub source_count: usize,
    /// Urls of the most reliable cited sources.
    #[serde(default)]
    pub reliable_sources: Vec<String>,
    /// Eligible for promotion into entity memory at job end.
    #[serde(default)]
    pub promotable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedApproach {
    pub branch: BranchType,
    pub attempt: u32,
    pub approach: String,
    pub error: String,
    pub avoid: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub description: String,
    pub branches: Vec<BranchType>,
    pub resolved: bool,
}

/// Result of [`Scratchpad::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub notes_dropped: usize,
    pub approaches_dropped: usize,
    pub facts_trimmed: usize,
}

impl CompactionReport {
    pub fn changed(&self) -> bool {
        self.notes_dropped + self.approaches_dropped + self.facts_trimmed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scratchpad {
    pub job_id: String,
    pub entity_name: String,
    pub entity_type: String,
    pub phase: JobPhase,
    pub global_goals: Vec<String>,
    pub todo_list: Vec<TodoItem>,
    pub branch_progress: BTreeMap<BranchType, BranchProgress>,
    pub finding_summaries: BTreeMap<BranchType, BranchFindingSummary>,
    pub failed_approaches: Vec<FailedApproach>,
    pub contradictions: Vec<Contradiction>,
    pub working_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scratchpad {
    /// Seed a job's scratchpad: fixed global goals, one todo per initial
    /// branch, then the two fixed trailing todos.
    pub fn create(
        job_id: &str,
        entity_name: &str,
        entity_type: &str,
        branches: &[BranchType],
        now: DateTime<Utc>,
    ) -> Self {
        let mut pad = Self {
            job_id: job_id.to_string(),
            entity_name: entity_name.to_string(),
            entity_type: entity_type.to_string(),
            phase: JobPhase::Researching,
            global_goals: GLOBAL_GOALS.iter().map(|g| (*g).to_string()).collect(),
            todo_list: vec![
                TodoItem {
                    id: "todo-cross-check".to_string(),
                    description: TODO_CROSS_CHECK.to_string(),
                    branch: None,
                    status: TodoStatus::Pending,
                },
                TodoItem {
                    id: "todo-synthesize".to_string(),
                    description: TODO_SYNTHESIZE.to_string(),
                    branch: None,
                    status: TodoStatus::Pending,
                },
            ],
            branch_progress: BTreeMap::new(),
            finding_summaries: BTreeMap::new(),
            failed_approaches: Vec::new(),
            contradictions: Vec::new(),
            working_notes: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        for branch in branches {
            pad.register_branch(*branch, None, now);
        }
        pad
    }

    /// Add a branch (initial or spawned) with a pending todo ahead of the
    /// trailing fixed todos. No-op if the branch already exists.
    pub fn register_branch(
        &mut self,
        branch: BranchType,
        spawned_by: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.branch_progress.contains_key(&branch) {
            return false;
        }
        self.branch_progress
            .insert(branch, BranchProgress::pending(spawned_by));
        let insert_at = self
            .todo_list
            .iter()
            .position(|todo| todo.branch.is_none())
            .unwrap_or(self.todo_list.len());
        self.todo_list.insert(
            insert_at,
            TodoItem {
                id: format!("todo-{}", branch.as_str()),
                description: format!("Research {}", branch.label().to_lowercase()),
                branch: Some(branch),
                status: TodoStatus::Pending,
            },
        );
        self.updated_at = now;
        true
    }

    /// Branches that exist in this job, whatever their status.
    pub fn spawned_branches(&self) -> BTreeSet<BranchType> {
        self.branch_progress.keys().copied().collect()
    }

    /// Branches holding a slot against the global budget.
    pub fn live_branch_count(&self) -> usize {
        self.branch_progress
            .values()
            .filter(|progress| progress.counts_against_budget())
            .count()
    }

    pub fn branches_with_status(&self, status: BranchStatus) -> Vec<BranchType> {
        self.branch_progress
            .iter()
            .filter(|(_, progress)| progress.status == status)
            .map(|(branch, _)| *branch)
            .collect()
    }

    pub fn start_branch(&mut self, branch: BranchType, now: DateTime<Utc>) {
        self.register_branch(branch, None, now);
        if let Some(progress) = self.branch_progress.get_mut(&branch) {
            progress.status = BranchStatus::Running;
            progress.attempts += 1;
            progress.started_at = Some(now);
            progress.finished_at = None;
        }
        self.set_todo_status(branch, TodoStatus::InProgress);
        self.updated_at = now;
    }

    pub fn record_usage(&mut self, branch: BranchType, usage: BranchUsage) {
        if let Some(progress) = self.branch_progress.get_mut(&branch) {
            progress.tool_calls += usage.tool_calls;
            progress.tokens_used += usage.tokens;
        }
    }

    /// Store a branch's summary and mark it completed.
    pub fn record_summary(&mut self, summary: BranchFindingSummary, now: DateTime<Utc>) {
        let branch = summary.branch;
        if let Some(progress) = self.branch_progress.get_mut(&branch) {
            progress.status = BranchStatus::Completed;
            progress.last_error = None;
            progress.finished_at = Some(now);
        }
        self.finding_summaries.insert(branch, summary);
        self.set_todo_status(branch, TodoStatus::Completed);
        self.updated_at = now;
    }

    pub fn record_failure(&mut self, branch: BranchType, error: &str, now: DateTime<Utc>) {
        if let Some(progress) = self.branch_progress.get_mut(&branch) {
            progress.status = BranchStatus::Failed;
            progress.last_error = Some(error.to_string());
            progress.finished_at = Some(now);
        }
        self.set_todo_status(branch, TodoStatus::Blocked);
        self.updated_at = now;
    }

    /// Mark a branch that will not run. Only pending branches can be skipped.
    pub fn skip_branch(&mut self, branch: BranchType, now: DateTime<Utc>) -> bool {
        let Some(progress) = self.branch_progress.get_mut(&branch) else {
            return false;
        };
        if progress.status != BranchStatus::Pending {
            return false;
        }
        progress.status = BranchStatus::Skipped;
        progress.finished_at = Some(now);
        self.set_todo_status(branch, TodoStatus::Blocked);
        self.updated_at = now;
        true
    }

    /// Append to the bounded failed-approach log, deriving avoid hints from
    /// the error text.
    pub fn record_failed_approach(
        &mut self,
        branch: BranchType,
        attempt: u32,
        approach: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailedApproach {
        let entry = FailedApproach {
            branch,
            attempt,
            approach: approach.to_string(),
            error: error.to_string(),
            avoid: avoid_hints(error),
            recorded_at: now,
        };
        self.failed_approaches.push(entry.clone());
        let overflow = self
            .failed_approaches
            .len()
            .saturating_sub(MAX_FAILED_APPROACHES);
        self.failed_approaches.drain(..overflow);
        self.updated_at = now;
        entry
    }

    pub fn failed_approaches_for(&self, branch: BranchType) -> Vec<&FailedApproach> {
        self.failed_approaches
            .iter()
            .filter(|entry| entry.branch == branch)
            .collect()
    }

    pub fn add_contradiction(
        &mut self,
        description: &str,
        branches: Vec<BranchType>,
        now: DateTime<Utc>,
    ) {
        self.contradictions.push(Contradiction {
            description: description.to_string(),
            branches,
            resolved: false,
        });
        self.updated_at = now;
    }

    pub fn add_note(&mut self, note: &str, now: DateTime<Utc>) {
        self.working_notes.push(note.to_string());
        let overflow = self.working_notes.len().saturating_sub(MAX_WORKING_NOTES);
        self.working_notes.drain(..overflow);
        self.updated_at = now;
    }

    pub fn set_phase(&mut self, phase: JobPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.updated_at = now;
    }

    /// Open questions left at the end of a job: unfinished branch todos and
    /// unresolved contradictions.
    pub fn open_questions(&self) -> Vec<String> {
        let mut questions: Vec<String> = self
            .todo_list
            .iter()
            .filter(|todo| todo.branch.is_some())
            .filter(|todo| todo.status != TodoStatus::Completed)
            .map(|todo| format!("Incomplete: {}", todo.description))
            .collect();
        questions.extend(
            self.contradictions
                .iter()
                .filter(|c| !c.resolved)
                .map(|c| format!("Unresolved contradiction: {}", c.description)),
        );
        questions
    }

    /// Rough token estimate of the serialized record (4 bytes per token).
    pub fn estimated_tokens(&self) -> usize {
        serde_json::to_string(self).map_or(0, |json| json.len().div_ceil(4))
    }

    /// Shrink the record until it fits `token_budget`: drop oldest working
    /// notes, then oldest failed approaches, then trim summary key facts.
    pub fn compact(&mut self, token_budget: usize) -> CompactionReport {
        let mut report = CompactionReport {
            tokens_before: self.estimated_tokens(),
            ..CompactionReport::default()
        };
        let mut tokens = report.tokens_before;

        while tokens > token_budget && !self.working_notes.is_empty() {
            self.working_notes.remove(0);
            report.notes_dropped += 1;
            tokens = self.estimated_tokens();
        }
        while tokens > token_budget && !self.failed_approaches.is_empty() {
            self.failed_approaches.remove(0);
            report.approaches_dropped += 1;
            tokens = self.estimated_tokens();
        }
        if tokens > token_budget {
            for summary in self.finding_summaries.values_mut() {
                if summary.key_facts.len() > COMPACTED_KEY_FACTS {
                    report.facts_trimmed += summary.key_facts.len() - COMPACTED_KEY_FACTS;
                    summary.key_facts.truncate(COMPACTED_KEY_FACTS);
                }
            }
            tokens = self.estimated_tokens();
        }

        report.tokens_after = tokens;
        report
    }

    fn set_todo_status(&mut self, branch: BranchType, status: TodoStatus) {
        for todo in &mut self.todo_list {
            if todo.branch == Some(branch) {
                todo.status = status;
            }
        }
    }
}

/// Coarse hints derived from an error message. Empty when nothing matches.
pub fn avoid_hints(error: &str) -> Vec<String> {
    let lower = error.to_lowercase();
    let mut hints = Vec::new();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
    {
        hints.push("Back off and batch queries; avoid rapid repeated searches".to_string());
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        hints.push("Use narrower queries or smaller result pages".to_string());
    }
    if lower.contains("not found") || lower.contains("404") || lower.contains("no results") {
        hints.push("Try alternate entity names, spellings or identifiers".to_string());
    }
    if lower.contains("invalid") || lower.contains("malformed") {
        hints.push("Validate query parameters before calling the tool".to_string());
    }
    if lower.contains("auth") || lower.contains("401") || lower.contains("403") {
        hints.push("Skip sources that require credentials".to_string());
    }
    hints
}

//! Cross-job memory keyed by normalized entity name.
//!
//! Merge rules:
//! - facts dedup by case-insensitive text; the first stored copy wins and
//!   later restatements (even with higher confidence) are dropped;
//! - facts keep the [`MAX_VERIFIED_FACTS`] most recent by `verified_at`;
//! - previous jobs upsert by job id and keep the [`MAX_PREVIOUS_JOBS`] most
//!   recent by `completed_at`.
//!
//! Nothing is ever deleted except by these recency caps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::summarize::clamp_confidence;

pub const MAX_VERIFIED_FACTS: usize = 100;
pub const MAX_PREVIOUS_JOBS: usize = 10;
pub const MAX_RELIABLE_SOURCES: usize = 25;
pub const MAX_JOB_KEY_FINDINGS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedFact {
    pub fact: String,
    pub category: String,
    pub source: String,
    pub confidence: f64,
    pub job_id: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub verdict: String,
    pub confidence: f64,
    pub key_findings: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMemory {
    pub entity_key: String,
    pub entity_name: String,
    pub entity_type: String,
    pub verified_facts: Vec<VerifiedFact>,
    pub previous_jobs: Vec<JobSummary>,
    pub unresolved_questions: Vec<String>,
    pub reliable_sources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fact proposed for promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactInput {
    pub fact: String,
    pub category: String,
    pub source: String,
    pub confidence: f64,
}

/// End-of-job update for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity_type: String,
    pub job_id: String,
    pub verdict: String,
    pub overall_confidence: f64,
    pub key_findings: Vec<String>,
    pub verified_facts: Vec<FactInput>,
    /// `None` keeps the stored questions; `Some` replaces them.
    pub unresolved_questions: Option<Vec<String>>,
    pub reliable_sources: Vec<String>,
}

/// Stable storage key: lowercase alphanumeric words joined by `-`.
pub fn normalize_entity_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Upsert `update` into `existing` (or a fresh record) and apply retention.
pub fn apply_update(
    existing: Option<EntityMemory>,
    entity_name: &str,
    update: EntityUpdate,
    now: DateTime<Utc>,
) -> EntityMemory {
    let mut memory = existing.unwrap_or_else(|| EntityMemory {
        entity_key: normalize_entity_name(entity_name),
        entity_name: entity_name.to_string(),
        entity_type: update.entity_type.clone(),
        verified_facts: Vec::new(),
        previous_jobs: Vec::new(),
        unresolved_questions: Vec::new(),
        reliable_sources: Vec::new(),
        created_at: now,
        updated_at: now,
    });

    merge_facts(&mut memory, &update.job_id, update.verified_facts, now);

    memory.previous_jobs.retain(|job| job.job_id != update.job_id);
    memory.previous_jobs.insert(
        0,
        JobSummary {
            job_id: update.job_id,
            verdict: update.verdict,
            confidence: clamp_confidence(update.overall_confidence),
            key_findings: update
                .key_findings
                .into_iter()
                .take(MAX_JOB_KEY_FINDINGS)
                .collect(),
            completed_at: now,
        },
    );
    memory
        .previous_jobs
        .sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    memory.previous_jobs.truncate(MAX_PREVIOUS_JOBS);

    if let Some(questions) = update.unresolved_questions {
        memory.unresolved_questions = questions;
    }

    for source in update.reliable_sources {
        if !memory.reliable_sources.contains(&source) {
            memory.reliable_sources.push(source);
        }
    }
    let overflow = memory
        .reliable_sources
        .len()
        .saturating_sub(MAX_RELIABLE_SOURCES);
    memory.reliable_sources.drain(..overflow);

    memory.entity_type = update.entity_type;
    memory.updated_at = now;
    memory
}

fn merge_facts(memory: &mut EntityMemory, job_id: &str, facts: Vec<FactInput>, now: DateTime<Utc>) {
    let mut seen: Vec<String> = memory
        .verified_facts
        .iter()
        .map(|fact| fact_key(&fact.fact))
        .collect();
    let mut fresh = Vec::new();
    for input in facts {
        let key = fact_key(&input.fact);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        fresh.push(VerifiedFact {
            fact: input.fact.trim().to_string(),
            category: input.category,
            source: input.source,
            confidence: clamp_confidence(input.confidence),
            job_id: job_id.to_string(),
            verified_at: now,
        });
    }
    if fresh.is_empty() {
        return;
    }
    // New facts go first so ties on `verified_at` evict older entries.
    fresh.append(&mut memory.verified_facts);
    fresh.sort_by(|a, b| b.verified_at.cmp(&a.verified_at));
    fresh.truncate(MAX_VERIFIED_FACTS);
    memory.verified_facts = fresh;
}

fn fact_key(fact: &str) -> String {
    fact.trim().to_lowercase()
}

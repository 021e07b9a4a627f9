//! Prompt material appended to a branch's instructions.
//!
//! All renderers are pure projections of their input records: identical
//! input renders byte-identical text.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::entity_memory::EntityMemory;
use crate::core::scratchpad::{Scratchpad, TodoItem, TodoStatus};
use crate::core::triggers::truncate_chars;
use crate::core::types::{BranchStatus, BranchType, Handoff};

const GOAL_RECITATION_TEMPLATE: &str = include_str!("prompts/goal_recitation.md");
const HANDOFF_CONTEXT_TEMPLATE: &str = include_str!("prompts/handoff_context.md");
const PRIOR_KNOWLEDGE_TEMPLATE: &str = include_str!("prompts/prior_knowledge.md");

/// Other open todos listed besides the current branch's own.
pub const MAX_OTHER_TODOS: usize = 5;
/// Most recent verified facts included in prior knowledge.
pub const MAX_PRIOR_FACTS: usize = 10;
const SUMMARY_LINE_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct TodoLine<'a> {
    mark: &'static str,
    description: &'a str,
}

impl<'a> TodoLine<'a> {
    fn from_todo(todo: &'a TodoItem) -> Self {
        let mark = match todo.status {
            TodoStatus::InProgress => "~",
            TodoStatus::Completed => "x",
            TodoStatus::Blocked => "!",
            TodoStatus::Pending => " ",
        };
        Self {
            mark,
            description: &todo.description,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletedLine {
    label: &'static str,
    confidence: u32,
    summary: String,
}

#[derive(Debug, Serialize)]
struct FailedLine<'a> {
    attempt: u32,
    approach: &'a str,
    error: &'a str,
    avoid: &'a [String],
}

#[derive(Debug, Serialize)]
struct FactLine<'a> {
    fact: &'a str,
    category: &'a str,
    confidence: u32,
}

#[derive(Debug, Serialize)]
struct JobLine<'a> {
    job_id: &'a str,
    date: String,
    verdict: &'a str,
    confidence: u32,
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("goal_recitation", GOAL_RECITATION_TEMPLATE)?;
    env.add_template("handoff_context", HANDOFF_CONTEXT_TEMPLATE)?;
    env.add_template("prior_knowledge", PRIOR_KNOWLEDGE_TEMPLATE)?;
    Ok(env)
}

fn is_open(todo: &TodoItem) -> bool {
    matches!(todo.status, TodoStatus::Pending | TodoStatus::InProgress)
}

fn percent(confidence: f64) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u32
}

/// Goals, the branch's own open todo, up to five other open todos, one line
/// per completed branch, and the failed approaches recorded for `branch`.
pub fn render_goal_recitation(pad: &Scratchpad, branch: BranchType) -> Result<String> {
    let current = pad
        .todo_list
        .iter()
        .find(|todo| todo.branch == Some(branch) && is_open(todo))
        .map(TodoLine::from_todo);
    let other_todos: Vec<TodoLine<'_>> = pad
        .todo_list
        .iter()
        .filter(|todo| todo.branch != Some(branch) && is_open(todo))
        .take(MAX_OTHER_TODOS)
        .map(TodoLine::from_todo)
        .collect();
    // BTreeMap iteration keeps this in branch order.
    let completed: Vec<CompletedLine> = pad
        .finding_summaries
        .values()
        .filter(|summary| {
            pad.branch_progress
                .get(&summary.branch)
                .is_some_and(|p| p.status == BranchStatus::Completed)
        })
        .map(|summary| CompletedLine {
            label: summary.branch.label(),
            confidence: percent(summary.confidence),
            summary: truncate_chars(&summary.summary_text, SUMMARY_LINE_CHARS),
        })
        .collect();
    let failed: Vec<FailedLine<'_>> = pad
        .failed_approaches_for(branch)
        .into_iter()
        .map(|entry| FailedLine {
            attempt: entry.attempt,
            approach: &entry.approach,
            error: &entry.error,
            avoid: &entry.avoid,
        })
        .collect();

    let env = environment()?;
    let rendered = env.get_template("goal_recitation")?.render(context! {
        branch_label => branch.label(),
        entity_name => pad.entity_name.as_str(),
        entity_type => pad.entity_type.as_str(),
        goals => &pad.global_goals,
        current => current,
        other_todos => other_todos,
        completed => completed,
        failed => failed,
    })?;
    Ok(rendered)
}

/// The `context` block of the handoff that spawned a branch.
pub fn render_handoff_context(handoff: &Handoff) -> Result<String> {
    let env = environment()?;
    let ctx = &handoff.context;
    let rendered = env.get_template("handoff_context")?.render(context! {
        from_label => handoff.from.label(),
        priority => handoff.priority.as_str(),
        reason => handoff.reason.as_str(),
        trigger => ctx.trigger.trim(),
        relevant_findings => ctx.relevant_findings.trim(),
        focus_areas => &ctx.focus_areas,
        questions => &ctx.questions,
    })?;
    Ok(rendered)
}

/// What earlier jobs established about the entity.
pub fn render_prior_knowledge(memory: &EntityMemory) -> Result<String> {
    let facts: Vec<FactLine<'_>> = memory
        .verified_facts
        .iter()
        .take(MAX_PRIOR_FACTS)
        .map(|fact| FactLine {
            fact: &fact.fact,
            category: &fact.category,
            confidence: percent(fact.confidence),
        })
        .collect();
    let jobs: Vec<JobLine<'_>> = memory
        .previous_jobs
        .iter()
        .map(|job| JobLine {
            job_id: &job.job_id,
            date: job.completed_at.format("%Y-%m-%d").to_string(),
            verdict: &job.verdict,
            confidence: percent(job.confidence),
        })
        .collect();

    let env = environment()?;
    let rendered = env.get_template("prior_knowledge")?.render(context! {
        entity_name => memory.entity_name.as_str(),
        facts => facts,
        jobs => jobs,
        questions => &memory.unresolved_questions,
    })?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity_memory::{EntityUpdate, FactInput, apply_update};
    use crate::core::scratchpad::BranchFindingSummary;
    use crate::core::types::{HandoffContext, HandoffStatus, Priority};
    use chrono::{TimeZone, Utc};

    fn pad() -> Scratchpad {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("time");
        let mut pad = Scratchpad::create(
            "job-1",
            "Acme Corp",
            "company",
            &BranchType::DEFAULT_INITIAL,
            now,
        );
        pad.start_branch(BranchType::CompanyProfile, now);
        pad.record_summary(
            BranchFindingSummary {
                branch: BranchType::CompanyProfile,
                summary_text: "Acme sells freight routing software.".to_string(),
                key_facts: vec!["Industry: Logistics".to_string()],
                confidence: 0.82,
                source_count: 3,
                reliable_sources: Vec::new(),
                promotable: true,
            },
            now,
        );
        pad.record_failed_approach(
            BranchType::TeamFounders,
            1,
            "search founder names on news sites",
            "HTTP 429 rate limit",
            now,
        );
        pad.record_failed_approach(
            BranchType::MarketCompetitive,
            1,
            "scrape competitor list",
            "timeout",
            now,
        );
        pad
    }

    #[test]
    fn recitation_lists_goals_task_and_completed_branches() {
        let text = render_goal_recitation(&pad(), BranchType::TeamFounders).expect("render");
        assert!(text.contains("## Goal recitation: Team and founders"));
        for goal in crate::core::scratchpad::GLOBAL_GOALS {
            assert!(text.contains(goal), "missing goal {goal}");
        }
        assert!(text.contains("- [ ] Research team and founders"));
        assert!(text.contains("- [ ] Research market and competition"));
        assert!(text.contains(&format!("- [ ] {}", crate::core::scratchpad::TODO_SYNTHESIZE)));
        assert!(text.contains("Company profile (82% confidence): Acme sells freight routing software."));
        assert!(!text.contains("- [ ] Research company profile"));
    }

    #[test]
    fn recitation_shows_only_this_branch_failures() {
        let text = render_goal_recitation(&pad(), BranchType::TeamFounders).expect("render");
        assert!(text.contains("search founder names on news sites"));
        assert!(text.contains("Avoid: Back off and batch queries"));
        assert!(!text.contains("scrape competitor list"));
    }

    #[test]
    fn recitation_is_deterministic() {
        let pad = pad();
        let first = render_goal_recitation(&pad, BranchType::MarketCompetitive).expect("render");
        let second = render_goal_recitation(&pad, BranchType::MarketCompetitive).expect("render");
        assert_eq!(first, second);
    }

    #[test]
    fn other_todos_are_capped() {
        let mut pad = pad();
        for branch in BranchType::ALL {
            pad.register_branch(branch, None, Utc::now());
        }
        let text = render_goal_recitation(&pad, BranchType::Regulatory).expect("render");
        let section = text
            .split("### Other open work")
            .nth(1)
            .expect("other work section");
        let listed = section
            .lines()
            .take_while(|line| !line.starts_with("###"))
            .filter(|line| line.starts_with("- ["))
            .count();
        assert_eq!(listed, MAX_OTHER_TODOS);
    }

    #[test]
    fn handoff_context_renders_all_blocks() {
        let handoff = Handoff {
            id: "handoff_1".to_string(),
            from: BranchType::CompanyProfile,
            to: BranchType::Regulatory,
            reason: "Company operates in a regulated industry".to_string(),
            priority: Priority::High,
            context: HandoffContext {
                trigger: "industry: fintech".to_string(),
                relevant_findings: "{\"industry\":\"fintech\"}".to_string(),
                focus_areas: vec!["Licensing".to_string()],
                questions: vec!["Which regulators oversee it?".to_string()],
            },
            status: HandoffStatus::Accepted,
            created_at: Utc::now(),
            processed_at: None,
            rejection: None,
        };
        let text = render_handoff_context(&handoff).expect("render");
        assert!(text.starts_with("## Handoff from Company profile research"));
        assert!(text.contains("Priority: high"));
        assert!(text.contains("industry: fintech"));
        assert!(text.contains("- Licensing"));
        assert!(text.contains("- Which regulators oversee it?"));
    }

    #[test]
    fn prior_knowledge_lists_facts_and_jobs() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).single().expect("time");
        let memory = apply_update(
            None,
            "Acme Corp",
            EntityUpdate {
                entity_type: "company".to_string(),
                job_id: "job-0".to_string(),
                verdict: "proceed".to_string(),
                overall_confidence: 0.75,
                key_findings: Vec::new(),
                verified_facts: vec![FactInput {
                    fact: "Founded in 2019".to_string(),
                    category: "company_profile".to_string(),
                    source: "https://example.com".to_string(),
                    confidence: 0.9,
                }],
                unresolved_questions: Some(vec!["Who owns the patents?".to_string()]),
                reliable_sources: Vec::new(),
            },
            now,
        );
        let text = render_prior_knowledge(&memory).expect("render");
        assert!(text.contains("- Founded in 2019 (company_profile, 90% confidence)"));
        assert!(text.contains("- job-0 on 2026-02-01: proceed at 75% confidence"));
        assert!(text.contains("- Who owns the patents?"));
    }
}

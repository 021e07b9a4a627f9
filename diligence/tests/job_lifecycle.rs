//! Job-level tests driving the orchestrator end to end.
//!
//! These cover what unit tests cannot: waves of branches running on
//! threads, completions racing on one job, and entity memory shared by
//! jobs for the same entity.

use std::collections::BTreeSet;
use std::thread;

use serde_json::json;

use diligence::core::admission::MAX_TOTAL_BRANCHES;
use diligence::core::types::{BranchStatus, BranchType};
use diligence::io::config::OrchestratorConfig;
use diligence::io::store::MemoryStore;
use diligence::orchestrator::{JobSpec, Orchestrator};
use diligence::test_support::{ScriptedExecutor, TestState, fintech_profile, run};

fn spec(job_id: &str, branches: Vec<BranchType>) -> JobSpec {
    JobSpec {
        job_id: job_id.to_string(),
        entity_name: "Acme Corp".to_string(),
        entity_type: "company".to_string(),
        initial_branches: branches,
    }
}

fn noisy_findings() -> Vec<(BranchType, serde_json::Value)> {
    vec![
        (BranchType::CompanyProfile, fintech_profile()),
        (
            BranchType::TeamFounders,
            json!({
                "founders": ["Ada", "Grace"],
                "redFlags": ["Prior SEC settlement"],
                "notableConnections": ["Board seat at Initech"]
            }),
        ),
        (
            BranchType::MarketCompetitive,
            json!({
                "ipIntensive": true,
                "competitors": [
                    { "name": "Globex", "totalFunding": 120000000 },
                    { "name": "Hooli", "totalFunding": 80000000 }
                ]
            }),
        ),
        (
            BranchType::FinancialDeep,
            json!({
                "anomalies": ["Revenue restated in 2024"],
                "investors": ["A", "B", "C"]
            }),
        ),
    ]
}

/// Two waves: the initial three branches, then the three spawned by the
/// company profile. Finishing promotes only the confident profile facts.
#[test]
fn run_job_then_finish_promotes_profile_facts() {
    let orch = Orchestrator::new(MemoryStore::new(), OrchestratorConfig::default());
    let executor =
        ScriptedExecutor::new().with(BranchType::CompanyProfile, run(fintech_profile(), 0.9));

    let report = orch
        .run_job(&executor, &spec("job-1", Vec::new()))
        .expect("run job");
    assert_eq!(report.waves, 2);
    assert_eq!(report.completed.len(), 6);
    assert_eq!(report.handoffs_accepted, 3);
    assert_eq!(report.handoffs_rejected, 0);

    // Spawned branches got their handoff context; initial ones did not.
    for request in executor.calls() {
        let spawned = matches!(
            request.branch,
            BranchType::Regulatory | BranchType::IpPatents | BranchType::TechnicalDd
        );
        assert_eq!(request.handoff_context.is_some(), spawned, "{}", request.branch);
        assert!(request.prior_knowledge.is_none());
    }

    let queue = orch.queue_snapshot("job-1").expect("queue");
    assert!(queue.accepted.is_empty());
    assert_eq!(queue.completed.len(), 3);

    let memory = orch.finish_job("job-1", "proceed").expect("finish");
    assert!(!memory.verified_facts.is_empty());
    assert!(
        memory
            .verified_facts
            .iter()
            .all(|fact| fact.job_id == "job-1" && fact.category == "company_profile")
    );
    assert!(memory.unresolved_questions.is_empty());

    let kinds: Vec<&str> = orch
        .events("job-1")
        .expect("events")
        .iter()
        .map(|record| record.event.kind())
        .collect();
    assert_eq!(kinds.first(), Some(&"job_started"));
    assert_eq!(kinds.last(), Some(&"job_finished"));
    assert_eq!(kinds.iter().filter(|k| **k == "branch_started").count(), 6);
    assert_eq!(kinds.iter().filter(|k| **k == "handoff_accepted").count(), 3);
}

/// Four branches complete at once; every completion detects and admits
/// under the job lock, so the queue and scratchpad stay consistent.
#[test]
fn concurrent_completions_never_duplicate_or_overspend() {
    let orch = Orchestrator::new(MemoryStore::new(), OrchestratorConfig::default());
    let findings = noisy_findings();
    let initial: Vec<BranchType> = findings.iter().map(|(branch, _)| *branch).collect();
    orch.start_job(&spec("job-1", initial)).expect("start");

    thread::scope(|scope| {
        for (branch, findings) in &findings {
            let orch = &orch;
            scope.spawn(move || {
                orch.prepare_branch("job-1", *branch).expect("prepare");
                orch.complete_branch("job-1", *branch, &run(findings.clone(), 0.8))
                    .expect("complete");
            });
        }
    });

    let pad = orch.scratchpad("job-1").expect("pad");
    let queue = orch.queue_snapshot("job-1").expect("queue");
    assert!(pad.live_branch_count() <= MAX_TOTAL_BRANCHES);

    let mut targets = BTreeSet::new();
    for handoff in queue.accepted.iter().chain(&queue.completed) {
        assert!(targets.insert(handoff.to), "duplicate target {}", handoff.to);
    }
    assert_eq!(
        targets,
        BTreeSet::from([
            BranchType::TechnicalDd,
            BranchType::IpPatents,
            BranchType::Regulatory,
            BranchType::NetworkMapping,
        ])
    );
    assert!(queue.pending.is_empty());

    // Every spawned branch points back at the handoff that admitted it.
    for handoff in &queue.accepted {
        let progress = &pad.branch_progress[&handoff.to];
        assert_eq!(progress.status, BranchStatus::Pending);
        assert_eq!(progress.spawned_by.as_deref(), Some(handoff.id.as_str()));
    }
    assert_eq!(
        pad.branches_with_status(BranchStatus::Completed).len(),
        4
    );
}

/// With a tight per-pass limit and a full job, later proposals are rejected
/// and the budget holds across the whole run.
#[test]
fn budget_holds_across_a_full_run() {
    let config = OrchestratorConfig {
        max_additional_branches: 1,
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(MemoryStore::new(), config);
    let mut executor = ScriptedExecutor::new();
    let findings = noisy_findings();
    let initial: Vec<BranchType> = findings.iter().map(|(branch, _)| *branch).collect();
    for (branch, findings) in findings {
        executor = executor.with(branch, run(findings, 0.8));
    }

    let report = orch
        .run_job(&executor, &spec("job-1", initial))
        .expect("run job");

    let pad = orch.scratchpad("job-1").expect("pad");
    assert!(pad.live_branch_count() <= MAX_TOTAL_BRANCHES);
    assert!(report.handoffs_rejected > 0);
    assert!(report.failed.is_empty());
    let queue = orch.queue_snapshot("job-1").expect("queue");
    assert!(queue.rejected.iter().all(|handoff| handoff.rejection.is_some()));
    assert_eq!(
        report.completed.len() + report.skipped.len(),
        pad.branch_progress.len()
    );
}

/// A second job for the same entity sees the first job's memory, and two
/// jobs finishing at once both land in it.
#[test]
fn entity_memory_is_shared_across_jobs() {
    let state = TestState::new().expect("state");
    let orch = state.orchestrator();
    let profile = run(fintech_profile(), 0.9);
    let executor = ScriptedExecutor::new().with(BranchType::CompanyProfile, profile);

    orch.run_job(&executor, &spec("job-a", vec![BranchType::CompanyProfile]))
        .expect("run a");
    orch.finish_job("job-a", "proceed").expect("finish a");

    let second = ScriptedExecutor::new().with(BranchType::CompanyProfile, run(fintech_profile(), 0.9));
    orch.run_job(&second, &spec("job-b", vec![BranchType::CompanyProfile]))
        .expect("run b");
    let prior = second
        .calls()
        .into_iter()
        .find(|request| request.branch == BranchType::CompanyProfile)
        .and_then(|request| request.prior_knowledge)
        .expect("prior knowledge");
    assert!(prior.contains("## Prior knowledge: Acme Corp"));
    assert!(prior.contains("Industry: Fintech payments"));
    assert!(prior.contains("job-a"));

    orch.run_job(&second, &spec("job-c", vec![BranchType::CompanyProfile]))
        .expect("run c");
    thread::scope(|scope| {
        let orch = &orch;
        scope.spawn(move || orch.finish_job("job-b", "proceed").expect("finish b"));
        scope.spawn(move || orch.finish_job("job-c", "pass").expect("finish c"));
    });

    let memory = orch
        .entity_memory("ACME corp")
        .expect("read memory")
        .expect("memory exists");
    let jobs: BTreeSet<&str> = memory
        .previous_jobs
        .iter()
        .map(|job| job.job_id.as_str())
        .collect();
    assert_eq!(jobs, BTreeSet::from(["job-a", "job-b", "job-c"]));

    // Identical facts from later jobs are deduplicated.
    let texts: BTreeSet<&str> = memory
        .verified_facts
        .iter()
        .map(|fact| fact.fact.as_str())
        .collect();
    assert_eq!(texts.len(), memory.verified_facts.len());
    assert!(memory.verified_facts.iter().all(|fact| fact.job_id == "job-a"));

    assert!(state.path().join("entities/acme-corp.json").exists());
}

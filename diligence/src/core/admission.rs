//! Priority-based admission of pending handoffs under the global branch budget.
//!
//! Rules, applied to `pending` in stable priority order:
//! - a target already accepted or completed is rejected as a duplicate;
//! - while slots remain, handoffs are accepted;
//! - once slots are exhausted, a `high` handoff may preempt the most recently
//!   accepted `low` handoff (from this pass or an earlier one), taking its place;
//! - everything else is rejected. `pending` is always empty afterwards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::queue::HandoffQueue;
use crate::core::types::{BranchType, Handoff, HandoffStatus, Priority};

/// Hard ceiling on branches per job.
pub const MAX_TOTAL_BRANCHES: usize = 8;

pub const REJECT_DUPLICATE: &str = "duplicate branch";
pub const REJECT_BUDGET: &str = "branch budget exhausted";
pub const REJECT_PREEMPTED: &str = "preempted by high-priority handoff";

/// Outcome of one admission pass. The two lists are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub to_spawn: Vec<Handoff>,
    pub to_reject: Vec<Handoff>,
}

impl AdmissionDecision {
    /// Rejected handoffs that had been accepted by an earlier pass and were
    /// preempted by this one. Their branches must not start (or be skipped).
    pub fn revoked(&self) -> impl Iterator<Item = &Handoff> {
        self.to_reject
            .iter()
            .filter(|handoff| handoff.rejection.as_deref() == Some(REJECT_PREEMPTED))
    }
}

/// Slots available for this pass, floored at zero.
pub fn available_slots(max_additional_branches: usize, current_branch_count: usize) -> usize {
    max_additional_branches.min(MAX_TOTAL_BRANCHES.saturating_sub(current_branch_count))
}

/// Run one admission pass over `queue.pending`, moving every pending handoff
/// into `accepted` or `rejected`.
///
/// A preemption swaps one accepted `low` handoff for a `high` one, so it never
/// grows the number of live branches.
pub fn process(
    queue: &mut HandoffQueue,
    max_additional_branches: usize,
    current_branch_count: usize,
    now: DateTime<Utc>,
) -> AdmissionDecision {
    process_with(queue, max_additional_branches, current_branch_count, |_| true, now)
}

/// [`process`], preempting only accepted handoffs for which `preemptible`
/// holds (e.g. whose branch has not started yet).
pub fn process_with(
    queue: &mut HandoffQueue,
    max_additional_branches: usize,
    current_branch_count: usize,
    preemptible: impl Fn(&Handoff) -> bool,
    now: DateTime<Utc>,
) -> AdmissionDecision {
    let slots = available_slots(max_additional_branches, current_branch_count);
    let mut pending = std::mem::take(&mut queue.pending);
    pending.sort_by_key(|handoff| handoff.priority);

    let mut decision = AdmissionDecision::default();
    let mut admitted = 0usize;

    for handoff in pending {
        if target_taken(queue, handoff.to) {
            reject(queue, &mut decision, handoff, REJECT_DUPLICATE, now);
            continue;
        }

        if admitted < slots {
            admitted += 1;
            accept(queue, &mut decision, handoff, now);
            continue;
        }

        if handoff.priority == Priority::High
            && let Some(victim) = take_preemption_victim(queue, &mut decision, &preemptible)
        {
            info!(
                job_id = %queue.job_id,
                preempted = %victim.to,
                by = %handoff.to,
                "high-priority handoff preempts low-priority branch"
            );
            reject(queue, &mut decision, victim, REJECT_PREEMPTED, now);
            accept(queue, &mut decision, handoff, now);
            continue;
        }

        reject(queue, &mut decision, handoff, REJECT_BUDGET, now);
    }

    debug!(
        job_id = %queue.job_id,
        slots,
        spawned = decision.to_spawn.len(),
        rejected = decision.to_reject.len(),
        "admission pass complete"
    );
    decision
}

fn target_taken(queue: &HandoffQueue, to: BranchType) -> bool {
    queue
        .accepted
        .iter()
        .chain(&queue.completed)
        .any(|handoff| handoff.to == to)
}

fn accept(
    queue: &mut HandoffQueue,
    decision: &mut AdmissionDecision,
    mut handoff: Handoff,
    now: DateTime<Utc>,
) {
    handoff.status = HandoffStatus::Accepted;
    handoff.processed_at = Some(now);
    queue.accepted.push(handoff.clone());
    decision.to_spawn.push(handoff);
}

fn reject(
    queue: &mut HandoffQueue,
    decision: &mut AdmissionDecision,
    mut handoff: Handoff,
    reason: &str,
    now: DateTime<Utc>,
) {
    handoff.status = HandoffStatus::Rejected;
    handoff.processed_at = Some(now);
    handoff.rejection = Some(reason.to_string());
    queue.rejected.push(handoff.clone());
    decision.to_reject.push(handoff);
}

/// Remove and return the most recently accepted preemptible `low` handoff.
fn take_preemption_victim(
    queue: &mut HandoffQueue,
    decision: &mut AdmissionDecision,
    preemptible: &impl Fn(&Handoff) -> bool,
) -> Option<Handoff> {
    let idx = queue
        .accepted
        .iter()
        .rposition(|handoff| handoff.priority == Priority::Low && preemptible(handoff))?;
    let victim = queue.accepted.remove(idx);
    decision.to_spawn.retain(|handoff| handoff.id != victim.id);
    Some(victim)
}

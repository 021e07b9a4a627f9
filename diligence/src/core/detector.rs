//! Handoff detection over a completed branch's findings.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::triggers::{TRIGGER_REGISTRY, TriggerRule};
use crate::core::types::{BranchType, Handoff, HandoffStatus};

/// Evaluate the trigger registry against `findings` from `from`.
///
/// Returns one pending handoff per fired rule whose target is not in
/// `already_spawned`, sorted by priority. Equal priorities keep registry order.
pub fn detect(
    from: BranchType,
    findings: &Value,
    already_spawned: &BTreeSet<BranchType>,
) -> Vec<Handoff> {
    detect_with(TRIGGER_REGISTRY, from, findings, already_spawned, Utc::now())
}

/// [`detect`] over an explicit rule table and clock.
pub fn detect_with(
    registry: &[TriggerRule],
    from: BranchType,
    findings: &Value,
    already_spawned: &BTreeSet<BranchType>,
    now: DateTime<Utc>,
) -> Vec<Handoff> {
    let mut handoffs = Vec::new();
    for rule in registry.iter().filter(|rule| rule.from == from) {
        if already_spawned.contains(&rule.to) {
            continue;
        }
        match (rule.condition)(findings) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!(rule = rule.name, %from, error = %err, "trigger condition failed; treating as not fired");
                continue;
            }
        }
        debug!(rule = rule.name, %from, to = %rule.to, priority = rule.priority.as_str(), "trigger fired");
        handoffs.push(Handoff {
            id: new_handoff_id(),
            from,
            to: rule.to,
            reason: (rule.reason)(findings),
            priority: rule.priority,
            context: (rule.context)(findings),
            status: HandoffStatus::Pending,
            created_at: now,
            processed_at: None,
            rejection: None,
        });
    }
    // Stable: equal priorities keep declaration order.
    handoffs.sort_by_key(|handoff| handoff.priority);
    handoffs
}

fn new_handoff_id() -> String {
    format!("handoff_{}", Uuid::new_v4().simple())
}

//! Per-job handoff queue.
//!
//! A plain record with four ordered lists. Nothing is ever deleted: handoffs
//! only move between lists, so the union of the lists is the full proposal
//! history for the job. The queue has no concurrency control of its own;
//! callers serialize mutations per job.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{BranchType, Handoff, HandoffStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffQueue {
    pub job_id: String,
    pub pending: Vec<Handoff>,
    pub accepted: Vec<Handoff>,
    pub rejected: Vec<Handoff>,
    pub completed: Vec<Handoff>,
}

impl HandoffQueue {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    /// Append handoffs to `pending`, skipping any whose `(from, to)` pair is
    /// already pending. Returns the number appended.
    pub fn enqueue(&mut self, handoffs: impl IntoIterator<Item = Handoff>) -> usize {
        let mut added = 0;
        for mut handoff in handoffs {
            let duplicate = self
                .pending
                .iter()
                .any(|existing| existing.from == handoff.from && existing.to == handoff.to);
            if duplicate {
                debug!(job_id = %self.job_id, from = %handoff.from, to = %handoff.to, "dropping duplicate pending handoff");
                continue;
            }
            handoff.status = HandoffStatus::Pending;
            self.pending.push(handoff);
            added += 1;
        }
        added
    }

    /// Move the accepted handoff targeting `to` into `completed`.
    ///
    /// Returns `None` when `to` was not spawned through a handoff (e.g. an
    /// initial branch) or its handoff was preempted.
    pub fn complete(&mut self, to: BranchType, now: DateTime<Utc>) -> Option<&Handoff> {
        let idx = self.accepted.iter().position(|handoff| handoff.to == to)?;
        let mut handoff = self.accepted.remove(idx);
        handoff.status = HandoffStatus::Completed;
        handoff.processed_at = Some(now);
        self.completed.push(handoff);
        self.completed.last()
    }

    /// The live (accepted, not yet completed) handoff that spawned `to`.
    pub fn accepted_for(&self, to: BranchType) -> Option<&Handoff> {
        self.accepted.iter().find(|handoff| handoff.to == to)
    }

    /// Targets admitted at any point and not preempted.
    pub fn spawned_targets(&self) -> BTreeSet<BranchType> {
        self.accepted
            .iter()
            .chain(&self.completed)
            .map(|handoff| handoff.to)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.pending.len() + self.accepted.len() + self.rejected.len() + self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Priority;
    use crate::test_support::handoff;

    #[test]
    fn enqueue_dedups_pending_pairs() {
        let mut queue = HandoffQueue::new("job-1");
        let added = queue.enqueue(vec![
            handoff(BranchType::CompanyProfile, BranchType::Regulatory, Priority::High),
            handoff(BranchType::CompanyProfile, BranchType::Regulatory, Priority::Low),
            handoff(BranchType::TeamFounders, BranchType::Regulatory, Priority::High),
        ]);
        assert_eq!(added, 2);
        assert_eq!(queue.pending.len(), 2);
        assert_eq!(queue.pending[0].priority, Priority::High);
    }

    #[test]
    fn enqueue_allows_repeat_pair_once_actioned() {
        let mut queue = HandoffQueue::new("job-1");
        let mut actioned =
            handoff(BranchType::CompanyProfile, BranchType::Regulatory, Priority::High);
        actioned.status = HandoffStatus::Rejected;
        queue.rejected.push(actioned);

        let added = queue.enqueue(vec![handoff(
            BranchType::CompanyProfile,
            BranchType::Regulatory,
            Priority::High,
        )]);
        assert_eq!(added, 1);
    }

    #[test]
    fn complete_moves_accepted_to_completed() {
        let mut queue = HandoffQueue::new("job-1");
        let mut accepted =
            handoff(BranchType::CompanyProfile, BranchType::IpPatents, Priority::Normal);
        accepted.status = HandoffStatus::Accepted;
        queue.accepted.push(accepted);

        let total_before = queue.total();
        let done = queue
            .complete(BranchType::IpPatents, Utc::now())
            .expect("completed");
        assert_eq!(done.status, HandoffStatus::Completed);
        assert!(queue.accepted.is_empty());
        assert_eq!(queue.completed.len(), 1);
        assert_eq!(queue.total(), total_before);
        assert!(queue.spawned_targets().contains(&BranchType::IpPatents));
    }

    #[test]
    fn complete_without_handoff_is_none() {
        let mut queue = HandoffQueue::new("job-1");
        assert!(queue.complete(BranchType::CompanyProfile, Utc::now()).is_none());
    }
}

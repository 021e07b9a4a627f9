//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between core components and the
//! persisted records. They must stay JSON-serializable and must not depend on
//! external state or I/O.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Specialized research branch kinds. At most one branch of each kind exists
/// per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    CompanyProfile,
    TeamFounders,
    MarketCompetitive,
    TechnicalDd,
    IpPatents,
    Regulatory,
    FinancialDeep,
    NetworkMapping,
}

impl BranchType {
    pub const ALL: [BranchType; 8] = [
        BranchType::CompanyProfile,
        BranchType::TeamFounders,
        BranchType::MarketCompetitive,
        BranchType::TechnicalDd,
        BranchType::IpPatents,
        BranchType::Regulatory,
        BranchType::FinancialDeep,
        BranchType::NetworkMapping,
    ];

    /// Branches launched at job start when the caller does not choose.
    pub const DEFAULT_INITIAL: [BranchType; 3] = [
        BranchType::CompanyProfile,
        BranchType::TeamFounders,
        BranchType::MarketCompetitive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BranchType::CompanyProfile => "company_profile",
            BranchType::TeamFounders => "team_founders",
            BranchType::MarketCompetitive => "market_competitive",
            BranchType::TechnicalDd => "technical_dd",
            BranchType::IpPatents => "ip_patents",
            BranchType::Regulatory => "regulatory",
            BranchType::FinancialDeep => "financial_deep",
            BranchType::NetworkMapping => "network_mapping",
        }
    }

    /// Human-facing label used in rendered text.
    pub fn label(self) -> &'static str {
        match self {
            BranchType::CompanyProfile => "Company profile",
            BranchType::TeamFounders => "Team and founders",
            BranchType::MarketCompetitive => "Market and competition",
            BranchType::TechnicalDd => "Technical due diligence",
            BranchType::IpPatents => "IP and patents",
            BranchType::Regulatory => "Regulatory exposure",
            BranchType::FinancialDeep => "Financial deep dive",
            BranchType::NetworkMapping => "Network mapping",
        }
    }
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BranchType::ALL
            .into_iter()
            .find(|branch| branch.as_str() == s.trim())
            .ok_or_else(|| anyhow!("unknown branch type '{s}'"))
    }
}

/// Lifecycle of a branch execution within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Handoff priority. Ordering is `High < Normal < Low` so an ascending stable
/// sort yields processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Handoff lifecycle: `pending -> accepted -> completed` or `pending -> rejected`.
/// `rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
}

/// Extra prompt material handed to a branch spawned through a handoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    /// The finding value that fired the trigger.
    pub trigger: String,
    /// Bounded excerpt of the source branch's findings.
    pub relevant_findings: String,
    pub focus_areas: Vec<String>,
    pub questions: Vec<String>,
}

/// A request to spawn `to` because `from` produced findings that warrant it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub from: BranchType,
    pub to: BranchType,
    pub reason: String,
    pub priority: Priority,
    pub context: HandoffContext,
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Why the admission pass rejected this handoff, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

/// A cited source backing a branch's findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Heuristic reliability in `[0,1]`, when the branch scored it.
    #[serde(default)]
    pub reliability: Option<f64>,
}

/// Raw result of one branch execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOutput {
    /// Arbitrary structured findings. No field is guaranteed to be present.
    pub findings: Value,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub confidence: f64,
}

/// Resource usage reported by the branch executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchUsage {
    pub tool_calls: u32,
    pub tokens: u64,
    pub api_calls: u32,
}

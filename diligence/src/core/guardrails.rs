//! Pass/fail predicates run around a branch execution.
//!
//! A check fails when `issues` is non-empty. `warnings` are advisory and
//! never fail a check.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{BranchOutput, BranchUsage};

/// Usage at or above this fraction of a ceiling produces a warning.
pub const BUDGET_WARNING_RATIO: f64 = 0.8;
/// Confidence below this is reported as a warning.
pub const LOW_CONFIDENCE: f64 = 0.3;
pub const MIN_ENTITY_NAME_LEN: usize = 2;

static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts?)",
        r"(?i)disregard\s+(all\s+)?(previous|prior|above)",
        r"(?i)you\s+are\s+now\s+",
        r"(?i)system\s*prompt",
        r"(?i)</?\s*(system|assistant|user)\s*>",
        r"(?i)\bact\s+as\s+(an?\s+)?",
        r"(?i)jailbreak",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

const REFUSAL_PHRASES: [&str; 6] = [
    "i cannot help",
    "i can't help",
    "i'm unable to",
    "i am unable to",
    "as an ai language model",
    "i cannot provide",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub passed: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl GuardrailResult {
    fn from_parts(issues: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
            warnings,
        }
    }

    pub fn merge(mut self, other: GuardrailResult) -> Self {
        self.issues.extend(other.issues);
        self.warnings.extend(other.warnings);
        self.passed = self.issues.is_empty();
        self
    }
}

/// Per-branch resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLimits {
    pub max_tool_calls: u32,
    pub max_tokens: u64,
    pub max_api_calls: u32,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: 50,
            max_tokens: 200_000,
            max_api_calls: 40,
        }
    }
}

/// Entity name shape and prompt-injection screening.
pub fn validate_input(entity_name: &str, max_len: usize) -> GuardrailResult {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let name = entity_name.trim();
    let len = name.chars().count();

    if len < MIN_ENTITY_NAME_LEN {
        issues.push(format!(
            "entity name must be at least {MIN_ENTITY_NAME_LEN} characters"
        ));
    }
    if len > max_len {
        issues.push(format!("entity name exceeds {max_len} characters"));
    }
    if len > 0 && !name.chars().any(char::is_alphanumeric) {
        issues.push("entity name has no letters or digits".to_string());
    }
    if name.chars().any(char::is_control) {
        issues.push("entity name contains control characters".to_string());
    }
    if INJECTION_PATTERNS.iter().any(|re| re.is_match(name)) {
        issues.push("entity name matches a prompt-injection pattern".to_string());
    }
    if name.len() != entity_name.len() {
        warnings.push("entity name has surrounding whitespace".to_string());
    }

    GuardrailResult::from_parts(issues, warnings)
}

/// Findings, citations, confidence range and refusal phrasing.
pub fn validate_output(output: &BranchOutput) -> GuardrailResult {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    let empty = match &output.findings {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    };
    if empty {
        issues.push("findings are empty".to_string());
    }
    if output.sources.is_empty() {
        issues.push("no sources cited".to_string());
    }
    if !output.confidence.is_finite() || !(0.0..=1.0).contains(&output.confidence) {
        issues.push(format!(
            "confidence {} is outside [0, 1]",
            output.confidence
        ));
    } else if output.confidence < LOW_CONFIDENCE {
        warnings.push(format!("low confidence {:.2}", output.confidence));
    }

    let text = output.findings.to_string().to_lowercase();
    if let Some(phrase) = REFUSAL_PHRASES.iter().find(|phrase| text.contains(**phrase)) {
        issues.push(format!("findings contain refusal phrasing: \"{phrase}\""));
    }
    if output.sources.iter().any(|source| source.url.trim().is_empty()) {
        warnings.push("a cited source has an empty url".to_string());
    }

    GuardrailResult::from_parts(issues, warnings)
}

/// Issues once a ceiling is crossed, warnings from 80% of it.
pub fn check_budget(usage: &BranchUsage, limits: &UsageLimits) -> GuardrailResult {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let checks = [
        ("tool calls", u64::from(usage.tool_calls), u64::from(limits.max_tool_calls)),
        ("tokens", usage.tokens, limits.max_tokens),
        ("api calls", u64::from(usage.api_calls), u64::from(limits.max_api_calls)),
    ];
    for (what, used, limit) in checks {
        if used > limit {
            issues.push(format!("{what} {used} exceed limit {limit}"));
        } else if limit > 0 && used as f64 >= limit as f64 * BUDGET_WARNING_RATIO {
            warnings.push(format!("{what} {used} at or above 80% of limit {limit}"));
        }
    }
    GuardrailResult::from_parts(issues, warnings)
}

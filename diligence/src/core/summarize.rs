//! Branch-type-specific compaction of raw findings into a fixed-size summary.
//!
//! This is the only place unbounded findings are turned into the
//! representation stored in the scratchpad: at most three sentences of
//! summary text and at most [`MAX_KEY_FACTS`] key facts.

use serde_json::Value;

use crate::core::scratchpad::BranchFindingSummary;
use crate::core::triggers::truncate_chars;
use crate::core::types::{BranchType, Source};

pub const MAX_KEY_FACTS: usize = 8;
/// Sources scored at or above this are kept as reliable.
pub const RELIABLE_SOURCE_MIN: f64 = 0.8;

const NO_FINDINGS_SENTENCE: &str = "No recognizable findings were reported.";
const MAX_RELIABLE_SOURCES: usize = 5;
const MAX_FACT_CHARS: usize = 160;
const MAX_SENTENCE_CHARS: usize = 240;
const LIST_PREVIEW: usize = 3;

/// Findings fields worth surfacing per branch, as `(json key, label)`.
fn fact_fields(branch: BranchType) -> &'static [(&'static str, &'static str)] {
    match branch {
        BranchType::CompanyProfile => &[
            ("industry", "Industry"),
            ("foundedYear", "Founded"),
            ("headquarters", "Headquarters"),
            ("employeeCount", "Employees"),
            ("productType", "Product"),
            ("businessModel", "Business model"),
            ("stage", "Stage"),
            ("website", "Website"),
        ],
        BranchType::TeamFounders => &[
            ("founders", "Founders"),
            ("ceo", "CEO"),
            ("teamSize", "Team size"),
            ("keyHires", "Key hires"),
            ("redFlags", "Red flags"),
            ("notableConnections", "Connections"),
        ],
        BranchType::MarketCompetitive => &[
            ("marketSize", "Market size"),
            ("growthRate", "Growth rate"),
            ("competitors", "Competitors"),
            ("positioning", "Positioning"),
            ("moat", "Moat"),
        ],
        BranchType::TechnicalDd => &[
            ("architecture", "Architecture"),
            ("techStack", "Tech stack"),
            ("proprietaryTech", "Proprietary technology"),
            ("novelMethods", "Novel methods"),
            ("securityPosture", "Security"),
            ("technicalDebt", "Technical debt"),
        ],
        BranchType::IpPatents => &[
            ("patentCount", "Patents"),
            ("patents", "Patent list"),
            ("pendingApplications", "Pending applications"),
            ("trademarks", "Trademarks"),
            ("ipRisks", "IP risks"),
        ],
        BranchType::Regulatory => &[
            ("regulators", "Regulators"),
            ("licenses", "Licenses"),
            ("enforcementActions", "Enforcement actions"),
            ("complianceGaps", "Compliance gaps"),
            ("jurisdictions", "Jurisdictions"),
        ],
        BranchType::FinancialDeep => &[
            ("totalFunding", "Total funding"),
            ("lastRound", "Last round"),
            ("valuation", "Valuation"),
            ("revenue", "Revenue"),
            ("burnRate", "Burn rate"),
            ("runwayMonths", "Runway (months)"),
            ("investors", "Investors"),
            ("anomalies", "Anomalies"),
        ],
        BranchType::NetworkMapping => &[
            ("boardMembers", "Board"),
            ("advisors", "Advisors"),
            ("keyRelationships", "Key relationships"),
            ("conflicts", "Conflicts"),
        ],
    }
}

/// Compact one branch's findings. `confidence` is clamped into `[0,1]`.
pub fn summarize(
    branch: BranchType,
    findings: &Value,
    sources: &[Source],
    confidence: f64,
) -> BranchFindingSummary {
    let confidence = clamp_confidence(confidence);
    let mut key_facts = Vec::new();
    for (key, label) in fact_fields(branch) {
        if key_facts.len() == MAX_KEY_FACTS {
            break;
        }
        if let Some(value) = findings.get(*key).and_then(render_value) {
            key_facts.push(truncate_chars(&format!("{label}: {value}"), MAX_FACT_CHARS));
        }
    }
    if key_facts.is_empty() {
        key_facts = fallback_facts(findings);
    }

    let mut sentences = Vec::new();
    if let Some(headline) = headline(findings) {
        sentences.push(sentence(&headline));
    }
    if let Some(first) = key_facts.first() {
        sentences.push(sentence(first));
    }
    if sentences.is_empty() {
        sentences.push(NO_FINDINGS_SENTENCE.to_string());
    }
    sentences.push(format!(
        "{} research drew on {} source(s) at {:.0}% confidence.",
        branch.label(),
        sources.len(),
        confidence * 100.0
    ));

    BranchFindingSummary {
        branch,
        summary_text: sentences.join(" "),
        key_facts,
        confidence,
        source_count: sources.len(),
        reliable_sources: reliable_sources(sources),
        promotable: false,
    }
}

fn reliable_sources(sources: &[Source]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for source in sources {
        let url = source.url.trim();
        let reliable = source
            .reliability
            .is_some_and(|score| score >= RELIABLE_SOURCE_MIN);
        if reliable && !url.is_empty() && !urls.iter().any(|seen| seen == url) {
            urls.push(url.to_string());
        }
        if urls.len() == MAX_RELIABLE_SOURCES {
            break;
        }
    }
    urls
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

/// Free-text headline the branch may have produced itself.
fn headline(findings: &Value) -> Option<String> {
    ["summary", "overview", "description"]
        .iter()
        .find_map(|key| findings.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(first_sentence)
}

fn first_sentence(text: &str) -> String {
    let end = text
        .char_indices()
        .find(|&(idx, c)| matches!(c, '.' | '!' | '?') && text[idx + c.len_utf8()..].starts_with(' '))
        .map_or(text.len(), |(idx, c)| idx + c.len_utf8());
    truncate_chars(&text[..end], MAX_SENTENCE_CHARS)
}

fn sentence(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.ends_with(['.', '!', '?']) {
        trimmed.to_string()
    } else {
        format!("{trimmed}.")
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(String::from(if *b { "yes" } else { "no" })),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => {
            let names: Vec<String> = items.iter().take(LIST_PREVIEW).filter_map(item_name).collect();
            let more = items.len().saturating_sub(LIST_PREVIEW);
            let mut rendered = if names.is_empty() {
                format!("{} item(s)", items.len())
            } else {
                names.join(", ")
            };
            if more > 0 && !names.is_empty() {
                rendered.push_str(&format!(" (+{more} more)"));
            }
            Some(rendered)
        }
        Value::Object(map) => item_name(value).or_else(|| Some(format!("{} field(s)", map.len()))),
    }
}

fn item_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => ["name", "title", "label"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Scalar top-level fields in key order, for branches that returned nothing
/// we recognize.
fn fallback_facts(findings: &Value) -> Vec<String> {
    let Some(map) = findings.as_object() else {
        return Vec::new();
    };
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter(|key| !matches!(key.as_str(), "summary" | "overview" | "description"))
        .filter_map(|key| {
            let value = &map[key.as_str()];
            if value.is_array() || value.is_object() {
                return None;
            }
            render_value(value).map(|v| truncate_chars(&format!("{key}: {v}"), MAX_FACT_CHARS))
        })
        .take(MAX_KEY_FACTS)
        .collect()
}

//! Static handoff trigger table.
//!
//! Each rule is plain data: a source branch, a target branch, a priority and
//! three functions over the source branch's findings. Declaration order is the
//! tie-break order for equal priorities, so new rules go at the end of their
//! source branch's group.
//!
//! Conditions receive arbitrary JSON. Missing fields mean "not fired";
//! fields of the wrong shape produce an `Err`, which the detector logs and
//! also treats as "not fired".

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde_json::Value;

use crate::core::types::{BranchType, HandoffContext, Priority};

/// One `(from -> to)` handoff rule.
#[derive(Clone, Copy)]
pub struct TriggerRule {
    pub name: &'static str,
    pub from: BranchType,
    pub to: BranchType,
    pub priority: Priority,
    pub condition: fn(&Value) -> Result<bool>,
    pub reason: fn(&Value) -> String,
    pub context: fn(&Value) -> HandoffContext,
}

impl std::fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRule")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Maximum characters of findings copied into a handoff context.
pub const EXCERPT_MAX_CHARS: usize = 600;

/// `(keyword, pattern)` pairs; patterns match whole words, case-insensitively.
static REGULATED_KEYWORDS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    keyword_patterns(&[
        ("bank", r"banks?|banking"),
        ("biotech", r"biotech"),
        ("crypto", r"crypto(?:currency|currencies)?"),
        ("fintech", r"fintech"),
        ("gambling", r"gambling"),
        ("healthcare", r"healthcare|health\s+care"),
        ("insurance", r"insurance|insurtech"),
        ("lending", r"lending|lenders?"),
        ("medical", r"medical"),
        ("payments", r"payments?"),
        ("pharma", r"pharma(?:ceuticals?)?"),
        ("securities", r"securities"),
    ])
});

static TECHNICAL_PRODUCT_KEYWORDS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    keyword_patterns(&[
        ("api", r"apis?"),
        ("platform", r"platforms?"),
        ("saas", r"saas"),
        ("software", r"software"),
        ("hardware", r"hardware"),
    ])
});

fn keyword_patterns(entries: &[(&'static str, &str)]) -> Vec<(&'static str, Regex)> {
    entries
        .iter()
        .filter_map(|(keyword, pattern)| {
            Regex::new(&format!(r"(?i)\b(?:{pattern})\b"))
                .ok()
                .map(|regex| (*keyword, regex))
        })
        .collect()
}

fn first_keyword(keywords: &[(&'static str, Regex)], haystack: &str) -> Option<&'static str> {
    keywords
        .iter()
        .find(|(_, regex)| regex.is_match(haystack))
        .map(|(keyword, _)| *keyword)
}

pub static TRIGGER_REGISTRY: &[TriggerRule] = &[
    TriggerRule {
        name: "regulated_industry",
        from: BranchType::CompanyProfile,
        to: BranchType::Regulatory,
        priority: Priority::High,
        condition: |f| Ok(regulated_keyword(f)?.is_some()),
        reason: |f| {
            let keyword = regulated_keyword(f).ok().flatten().unwrap_or("regulated");
            format!("Company operates in a regulated sector ({keyword})")
        },
        context: |f| HandoffContext {
            trigger: regulated_keyword(f)
                .ok()
                .flatten()
                .unwrap_or_default()
                .to_string(),
            relevant_findings: excerpt(f, &["industry", "sector", "description", "headquarters"]),
            focus_areas: strings(&[
                "Licenses and registrations held",
                "Enforcement actions and consent orders",
                "Jurisdictions of operation",
            ]),
            questions: strings(&[
                "Which regulators oversee the company's core product?",
                "Are there pending investigations or fines?",
            ]),
        },
    },
    TriggerRule {
        name: "patent_signals",
        from: BranchType::CompanyProfile,
        to: BranchType::IpPatents,
        priority: Priority::Normal,
        condition: |f| {
            Ok(array_len(f, "patents")? > 0
                || number(f, "patentCount")?.unwrap_or(0.0) > 0.0
                || flag(f, "hasPatents")?)
        },
        reason: |_| "Company profile mentions patents or patent filings".to_string(),
        context: |f| HandoffContext {
            trigger: count_trigger(f, &["patentCount"], "patents"),
            relevant_findings: excerpt(f, &["patents", "patentCount", "hasPatents"]),
            focus_areas: strings(&[
                "Granted patents and pending applications",
                "Assignment of IP to the company",
            ]),
            questions: strings(&["Is the core technology covered by granted claims?"]),
        },
    },
    TriggerRule {
        name: "technical_product",
        from: BranchType::CompanyProfile,
        to: BranchType::TechnicalDd,
        priority: Priority::Normal,
        condition: |f| {
            if array_len(f, "techStack")? > 0 {
                return Ok(true);
            }
            let product = text(f, "productType")?.unwrap_or_default();
            Ok(first_keyword(&TECHNICAL_PRODUCT_KEYWORDS, &product).is_some())
        },
        reason: |_| "Product is technology-driven and needs technical review".to_string(),
        context: |f| HandoffContext {
            trigger: text(f, "productType").ok().flatten().unwrap_or_default(),
            relevant_findings: excerpt(f, &["productType", "techStack", "description"]),
            focus_areas: strings(&["Architecture and scalability", "Engineering team depth"]),
            questions: strings(&["How defensible is the technology stack?"]),
        },
    },
    TriggerRule {
        name: "founder_red_flags",
        from: BranchType::TeamFounders,
        to: BranchType::Regulatory,
        priority: Priority::High,
        condition: |f| Ok(array_len(f, "redFlags")? > 0),
        reason: |f| {
            format!(
                "Founder background check surfaced {} red flag(s)",
                array_len(f, "redFlags").unwrap_or(0)
            )
        },
        context: |f| HandoffContext {
            trigger: first_string(f, "redFlags").unwrap_or_default(),
            relevant_findings: excerpt(f, &["redFlags", "founders"]),
            focus_areas: strings(&["Litigation involving founders", "Prior regulatory actions"]),
            questions: strings(&["Are the red flags tied to the current company?"]),
        },
    },
    TriggerRule {
        name: "founder_network",
        from: BranchType::TeamFounders,
        to: BranchType::NetworkMapping,
        priority: Priority::Low,
        condition: |f| {
            if array_len(f, "notableConnections")? > 0 {
                return Ok(true);
            }
            let founders = array(f, "founders")?;
            let mut with_history = 0usize;
            for founder in founders {
                if array_len(founder, "priorCompanies")? > 0 {
                    with_history += 1;
                }
            }
            Ok(with_history >= 2)
        },
        reason: |_| "Founders have prior companies or notable connections to map".to_string(),
        context: |f| HandoffContext {
            trigger: first_string(f, "notableConnections").unwrap_or_default(),
            relevant_findings: excerpt(f, &["founders", "notableConnections"]),
            focus_areas: strings(&["Shared board seats", "Prior co-founders and investors"]),
            questions: strings(&["Which connections create conflicts of interest?"]),
        },
    },
    TriggerRule {
        name: "financial_anomalies",
        from: BranchType::FinancialDeep,
        to: BranchType::Regulatory,
        priority: Priority::High,
        condition: |f| {
            if array_len(f, "anomalies")? > 0 || array_len(f, "redFlags")? > 0 {
                return Ok(true);
            }
            let audit = text(f, "auditStatus")?.unwrap_or_default().to_lowercase();
            Ok(audit.contains("qualified") || audit.contains("restat"))
        },
        reason: |_| "Financial review found anomalies that may carry regulatory exposure".to_string(),
        context: |f| HandoffContext {
            trigger: first_string(f, "anomalies")
                .or_else(|| text(f, "auditStatus").ok().flatten())
                .unwrap_or_default(),
            relevant_findings: excerpt(f, &["anomalies", "redFlags", "auditStatus"]),
            focus_areas: strings(&["Securities filings", "Auditor opinions and restatements"]),
            questions: strings(&["Has any regulator opened an inquiry into the accounts?"]),
        },
    },
    TriggerRule {
        name: "investor_network",
        from: BranchType::FinancialDeep,
        to: BranchType::NetworkMapping,
        priority: Priority::Low,
        condition: |f| Ok(array_len(f, "investors")? >= 3),
        reason: |f| {
            format!(
                "Cap table lists {} investors worth mapping",
                array_len(f, "investors").unwrap_or(0)
            )
        },
        context: |f| HandoffContext {
            trigger: format!("{} investors", array_len(f, "investors").unwrap_or(0)),
            relevant_findings: excerpt(f, &["investors", "fundingRounds"]),
            focus_areas: strings(&["Lead investors across rounds", "Investor portfolio overlap"]),
            questions: strings(&["Do investors back direct competitors?"]),
        },
    },
    TriggerRule {
        name: "competitor_ip",
        from: BranchType::MarketCompetitive,
        to: BranchType::IpPatents,
        priority: Priority::Low,
        condition: |f| {
            if flag(f, "ipIntensive")? {
                return Ok(true);
            }
            for competitor in array(f, "competitors")? {
                if number(competitor, "patents")?.unwrap_or(0.0) > 0.0 {
                    return Ok(true);
                }
            }
            Ok(false)
        },
        reason: |_| "Competitors hold patents in the same market".to_string(),
        context: |f| HandoffContext {
            trigger: "competitor patents".to_string(),
            relevant_findings: excerpt(f, &["competitors", "ipIntensive"]),
            focus_areas: strings(&["Freedom to operate", "Overlapping patent families"]),
            questions: strings(&["Could a competitor assert patents against the company?"]),
        },
    },
    TriggerRule {
        name: "funding_benchmark",
        from: BranchType::MarketCompetitive,
        to: BranchType::FinancialDeep,
        priority: Priority::Normal,
        condition: |f| {
            let mut funded = 0usize;
            for competitor in array(f, "competitors")? {
                if number(competitor, "totalFunding")?.is_some() {
                    funded += 1;
                }
            }
            Ok(funded >= 2)
        },
        reason: |_| "Funded competitors require a financial benchmark".to_string(),
        context: |f| HandoffContext {
            trigger: "competitor funding".to_string(),
            relevant_findings: excerpt(f, &["competitors", "marketSize"]),
            focus_areas: strings(&["Burn rate versus funded peers", "Runway and next raise"]),
            questions: strings(&["Is the company capitalized in line with competitors?"]),
        },
    },
    TriggerRule {
        name: "proprietary_technology",
        from: BranchType::TechnicalDd,
        to: BranchType::IpPatents,
        priority: Priority::Normal,
        condition: |f| Ok(flag(f, "proprietaryTech")? || array_len(f, "novelMethods")? > 0),
        reason: |_| "Technical review found proprietary technology to protect".to_string(),
        context: |f| HandoffContext {
            trigger: first_string(f, "novelMethods").unwrap_or_else(|| "proprietary".to_string()),
            relevant_findings: excerpt(f, &["proprietaryTech", "novelMethods", "architecture"]),
            focus_areas: strings(&["Patentability of novel methods", "Trade secret handling"]),
            questions: strings(&["Are the novel methods filed or only trade secrets?"]),
        },
    },
    TriggerRule {
        name: "personal_data",
        from: BranchType::TechnicalDd,
        to: BranchType::Regulatory,
        priority: Priority::Low,
        condition: |f| {
            Ok(flag(f, "handlesPersonalData")? || array_len(f, "dataPrivacyConcerns")? > 0)
        },
        reason: |_| "Product processes personal data".to_string(),
        context: |f| HandoffContext {
            trigger: first_string(f, "dataPrivacyConcerns")
                .unwrap_or_else(|| "personal data".to_string()),
            relevant_findings: excerpt(f, &["handlesPersonalData", "dataPrivacyConcerns"]),
            focus_areas: strings(&["GDPR and CCPA posture", "Data breach history"]),
            questions: strings(&["Where is personal data stored and who processes it?"]),
        },
    },
];

fn regulated_keyword(findings: &Value) -> Result<Option<&'static str>> {
    let mut haystack = String::new();
    for key in ["industry", "sector", "description"] {
        if let Some(value) = text(findings, key)? {
            haystack.push_str(&value);
            haystack.push(' ');
        }
    }
    Ok(first_keyword(&REGULATED_KEYWORDS, &haystack))
}

/// Optional string field. Non-string values are an error.
fn text(findings: &Value, key: &str) -> Result<Option<String>> {
    match findings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => bail!("field '{key}' must be a string, got {}", kind(other)),
    }
}

/// Optional array field; absent reads as empty. Non-array values are an error.
fn array<'a>(findings: &'a Value, key: &str) -> Result<&'a [Value]> {
    match findings.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => bail!("field '{key}' must be an array, got {}", kind(other)),
    }
}

fn array_len(findings: &Value, key: &str) -> Result<usize> {
    Ok(array(findings, key)?.len())
}

fn number(findings: &Value, key: &str) -> Result<Option<f64>> {
    match findings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => bail!("field '{key}' must be a number, got {}", kind(other)),
    }
}

fn flag(findings: &Value, key: &str) -> Result<bool> {
    match findings.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => bail!("field '{key}' must be a boolean, got {}", kind(other)),
    }
}

fn first_string(findings: &Value, key: &str) -> Option<String> {
    let first = findings.get(key)?.as_array()?.first()?;
    match first {
        Value::String(s) => Some(s.clone()),
        other => other
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn count_trigger(findings: &Value, count_keys: &[&str], list_key: &str) -> String {
    for key in count_keys {
        if let Some(n) = findings.get(*key).and_then(Value::as_f64) {
            return format!("{n} {list_key}");
        }
    }
    let len = findings
        .get(list_key)
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    format!("{len} {list_key}")
}

/// Compact JSON of the selected keys, truncated on a char boundary.
pub fn excerpt(findings: &Value, keys: &[&str]) -> String {
    let mut selected = serde_json::Map::new();
    for key in keys {
        if let Some(value) = findings.get(*key)
            && !value.is_null()
        {
            selected.insert((*key).to_string(), value.clone());
        }
    }
    if selected.is_empty() {
        return String::new();
    }
    let rendered = Value::Object(selected).to_string();
    truncate_chars(&rendered, EXCERPT_MAX_CHARS)
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

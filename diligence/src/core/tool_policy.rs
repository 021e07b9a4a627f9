//! Static branch → permitted tool map.
//!
//! Entries are tool-name substrings. The executor uses the list to mask its
//! action space; nothing here intercepts tool calls.

use crate::core::types::BranchType;

const COMMON_TOOLS: &[&str] = &["web_search", "fetch_url", "scratchpad"];

pub fn allowed_tools(branch: BranchType) -> Vec<&'static str> {
    let specific: &[&str] = match branch {
        BranchType::CompanyProfile => &["company_lookup", "crunchbase", "linkedin_company"],
        BranchType::TeamFounders => &["linkedin_person", "people_search", "news_search"],
        BranchType::MarketCompetitive => &["market_data", "competitor", "news_search"],
        BranchType::TechnicalDd => &["github", "tech_stack", "security_scan"],
        BranchType::IpPatents => &["patent_search", "trademark_search", "uspto"],
        BranchType::Regulatory => &["sec_filings", "sanctions", "court_records", "regulator"],
        BranchType::FinancialDeep => &["sec_filings", "funding_rounds", "financial_data"],
        BranchType::NetworkMapping => &["people_search", "board_members", "relationship_graph"],
    };
    COMMON_TOOLS.iter().chain(specific).copied().collect()
}

/// True when `tool_name` contains one of the branch's entries, ignoring case.
pub fn is_tool_allowed(branch: BranchType, tool_name: &str) -> bool {
    let name = tool_name.to_lowercase();
    allowed_tools(branch)
        .iter()
        .any(|fragment| name.contains(fragment))
}

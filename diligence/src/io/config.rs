//! Orchestrator configuration stored under `<state-dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::guardrails::UsageLimits;

pub const CONFIG_FILE: &str = "config.toml";

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Slots a single admission pass may fill.
    pub max_additional_branches: usize,

    /// Minimum summary confidence for promotion into entity memory.
    pub promotion_confidence_threshold: f64,

    /// Scratchpad size (estimated tokens) enforced after each completion.
    pub scratchpad_token_budget: usize,

    pub limits: UsageLimits,

    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputConfig {
    pub max_entity_name_len: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_entity_name_len: 200,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_additional_branches: 4,
            promotion_confidence_threshold: 0.7,
            scratchpad_token_budget: 6_000,
            limits: UsageLimits::default(),
            input: InputConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.promotion_confidence_threshold) {
            return Err(anyhow!(
                "promotion_confidence_threshold must be within [0, 1]"
            ));
        }
        if self.scratchpad_token_budget == 0 {
            return Err(anyhow!("scratchpad_token_budget must be > 0"));
        }
        if self.limits.max_tool_calls == 0
            || self.limits.max_tokens == 0
            || self.limits.max_api_calls == 0
        {
            return Err(anyhow!("limits must all be > 0"));
        }
        if self.input.max_entity_name_len < 2 {
            return Err(anyhow!("input.max_entity_name_len must be >= 2"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::store::write_atomic(path, &buf)
}

//! Error kinds callers need to tell apart.
//!
//! Everything else travels as a plain `anyhow::Error` with context. These
//! variants are wrapped in `anyhow` too and recovered with `downcast_ref`.

use crate::exit_codes;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no scratchpad for job '{job_id}'")]
    ScratchpadMissing { job_id: String },

    #[error("input rejected: {}", issues.join("; "))]
    InputRejected { issues: Vec<String> },

    #[error("no entity memory for '{entity_key}'")]
    EntityMissing { entity_key: String },

    #[error("invalid store key '{key}': letters, digits, '.', '_' and '-' only")]
    InvalidKey { key: String },
}

impl OrchestratorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::ScratchpadMissing { .. }
            | OrchestratorError::EntityMissing { .. } => exit_codes::MISSING,
            OrchestratorError::InputRejected { .. } => exit_codes::REJECTED,
            OrchestratorError::InvalidKey { .. } => exit_codes::INVALID,
        }
    }
}

/// Exit code for any error surfaced by a command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<OrchestratorError>()
        .map_or(exit_codes::INVALID, OrchestratorError::exit_code)
}

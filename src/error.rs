//! Crate-wide error type

use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmError;
use crate::prompts::PromptError;
use crate::search::SearchError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Errors surfaced to callers of the research orchestrator
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Session {0} is already being processed")]
    SessionBusy(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid confirmation value: {0:?} (expected \"confirm\" or \"modify\")")]
    InvalidConfirmation(String),

    #[error("Cannot {action} while session is in stage {stage}")]
    InvalidTransition { action: &'static str, stage: String },

    #[error("Plan decode failed: {0}")]
    PlanDecode(String),

    #[error("Model error: {0}")]
    Model(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Session {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResearchError {
    /// Stable snake_case label for API payloads and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidConfirmation(_) => "invalid_confirmation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::PlanDecode(_) => "plan_decode",
            Self::Model(_) => "model",
            Self::Search(_) => "search",
            Self::Prompt(_) => "prompt",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the error is a broken caller/model contract rather than an outage
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidConfirmation(_)
                | Self::PlanDecode(_)
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<config::ConfigError> for ResearchError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for ResearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

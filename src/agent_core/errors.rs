//! Agent Core error types.
//!
//! Tool failures never show up here: they are folded into the conversation
//! as error-tagged tool results. Only failures that end a query are errors.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that end a query.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The caller cancelled. `partial_output` holds what was already streamed.
    #[error("query cancelled")]
    Cancelled { partial_output: String },

    /// The requested provider is not configured.
    #[error("unknown provider: '{name}' (available: {})", available.join(", "))]
    UnknownProvider { name: String, available: Vec<String> },

    /// The provider call itself failed.
    #[error("provider error: {0}")]
    Provider(#[from] InferenceError),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled { .. })
    }
}

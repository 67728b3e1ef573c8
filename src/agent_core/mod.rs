//! Agent Core — the agentic query loop and its collaborators.
//!
//! Submodules:
//! - `processor`: QueryProcessor, the bounded think/act loop
//! - `sanitize`: Tool input-schema sanitization for providers
//! - `approvals`: Pending human-in-the-loop decisions keyed by id
//! - `sampling`: Provider-backed answers to `sampling/createMessage`
//! - `errors`: Agent-level error types

pub mod approvals;
pub mod errors;
pub mod processor;
pub mod sampling;
pub mod sanitize;

// Re-exports for convenience
pub use approvals::{ApprovalBroker, ApprovalKind, PendingApproval};
pub use errors::AgentError;
pub use processor::{
    AgentSettings, QueryOptions, QueryOutcome, QueryProcessor, StopReason, ToolCallApprover,
    ToolCaller,
};
pub use sampling::ProviderSampler;
pub use sanitize::{sanitize_input_schema, sanitize_tool};

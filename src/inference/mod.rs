//! Inference — LLM providers behind a single `create_message` call.
//!
//! This module handles:
//! - The provider-neutral conversation types (text, tool use, tool result)
//! - The Anthropic Messages API provider
//! - The OpenAI-compatible Chat Completions provider (OpenAI, Ollama)
//! - The named `ProviderSet` injected into the agent loop
//!
//! Switching vendors is a config change, not a code change.

pub mod anthropic;
pub mod errors;
pub mod openai;
pub mod provider;
pub mod types;

// Re-exports for convenience
pub use errors::InferenceError;
pub use provider::{LlmProvider, ProviderConfig, ProviderSet, ProvidersConfig};
pub use types::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, Message, Role, ToolDefinition,
};

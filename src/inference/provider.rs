//! The provider seam and the set of configured providers.
//!
//! A provider exposes a single `create_message` call. `ProviderSet` is an
//! explicit, injected collection keyed by name; queries pick a provider by
//! name at call time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use super::anthropic::AnthropicProvider;
use super::errors::InferenceError;
use super::openai::OpenAiProvider;
use super::types::{CreateMessageRequest, CreateMessageResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout. Tool-heavy turns on hosted models can be slow.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const ANTHROPIC: &str = "anthropic";
pub const OPENAI: &str = "openai";
pub const OLLAMA: &str = "ollama";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// An LLM backend that can answer one conversation turn.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Model used when the caller does not name one.
    fn default_model(&self) -> &str;

    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResponse, InferenceError>;
}

/// Build the shared HTTP client used by the providers.
pub(crate) fn build_http_client(endpoint: &str) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| InferenceError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Settings for one provider. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// The `providers:` section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub ollama: ProviderConfig,
}

// ─── ProviderSet ─────────────────────────────────────────────────────────────

/// Named providers available to the agent loop.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every provider the configuration allows.
    ///
    /// Hosted providers need an API key (from config or `ANTHROPIC_API_KEY` /
    /// `OPENAI_API_KEY`) and are skipped without one. Ollama is always added.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, InferenceError> {
        let mut set = Self::new();

        let anthropic_key = config
            .anthropic
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.is_empty());
        match anthropic_key {
            Some(key) => set.insert(Arc::new(AnthropicProvider::new(
                key,
                config.anthropic.base_url.clone(),
                config.anthropic.model.clone(),
            )?)),
            None => tracing::debug!(provider = ANTHROPIC, "no API key, provider disabled"),
        }

        let openai_key = config
            .openai
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());
        match openai_key {
            Some(key) => set.insert(Arc::new(OpenAiProvider::openai(
                key,
                config.openai.base_url.clone(),
                config.openai.model.clone(),
            )?)),
            None => tracing::debug!(provider = OPENAI, "no API key, provider disabled"),
        }

        set.insert(Arc::new(OpenAiProvider::ollama(
            config.ollama.base_url.clone(),
            config.ollama.model.clone(),
        )?));

        Ok(set)
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// Provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("providers", &self.names())
            .finish()
    }
}

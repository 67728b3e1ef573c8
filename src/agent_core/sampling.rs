//! Answers server-initiated `sampling/createMessage` with a local provider.
//!
//! Each request is put to the operator first (unless auto-approved); a
//! rejection goes back to the server as a JSON-RPC error.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::inference::{ContentBlock, CreateMessageRequest, Message, ProviderSet, Role};
use crate::mcp_client::types::{error_codes, JsonRpcError};
use crate::mcp_client::SamplingHandler;

use super::approvals::{ApprovalBroker, ApprovalKind};
use super::processor::DEFAULT_MAX_TOKENS;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplingParams {
    messages: Vec<SamplingMessage>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SamplingMessage {
    role: Role,
    content: Value,
}

/// Sampling hook backed by the configured providers.
pub struct ProviderSampler {
    providers: ProviderSet,
    provider: String,
    model: Option<String>,
    approvals: Option<ApprovalBroker>,
}

impl ProviderSampler {
    pub fn new(providers: ProviderSet, provider: impl Into<String>, model: Option<String>) -> Self {
        Self {
            providers,
            provider: provider.into(),
            model,
            approvals: None,
        }
    }

    /// Ask the operator before answering each request.
    pub fn with_approvals(mut self, approvals: ApprovalBroker) -> Self {
        self.approvals = Some(approvals);
        self
    }
}

#[async_trait]
impl SamplingHandler for ProviderSampler {
    async fn create_message(
        &self,
        server_name: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, JsonRpcError> {
        let parsed: SamplingParams = serde_json::from_value(params.clone()).map_err(|e| {
            JsonRpcError::new(
                error_codes::INVALID_PARAMS,
                format!("invalid sampling request: {e}"),
            )
        })?;

        if let Some(ref approvals) = self.approvals {
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                approved = approvals.request(ApprovalKind::Sampling, server_name, &params, None) => approved,
            };
            if !approved {
                tracing::info!(server = server_name, "sampling request rejected");
                return Err(JsonRpcError::new(
                    error_codes::USER_REJECTED,
                    "User rejected sampling request",
                ));
            }
        }

        let provider = self.providers.get(&self.provider).ok_or_else(|| {
            JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                format!("provider '{}' is not configured", self.provider),
            )
        })?;
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        let request = CreateMessageRequest {
            model,
            max_tokens: parsed.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: parsed.messages.into_iter().map(to_message).collect(),
            tools: Vec::new(),
            system: parsed.system_prompt,
        };

        tracing::info!(server = server_name, provider = provider.name(), "answering sampling request");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(JsonRpcError::new(error_codes::INTERNAL_ERROR, "Request cancelled"));
            }
            response = provider.create_message(request) => response,
        };
        let response =
            response.map_err(|e| JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))?;

        Ok(json!({
            "role": "assistant",
            "content": { "type": "text", "text": response.text() },
            "model": response.model.unwrap_or_else(|| provider.default_model().to_string()),
            "stopReason": response.stop_reason.as_deref().map(to_mcp_stop_reason),
        }))
    }
}

/// MCP sampling content is a single block; non-text blocks are passed as JSON.
fn to_message(message: SamplingMessage) -> Message {
    let text = match message.content.get("type").and_then(Value::as_str) {
        Some("text") => message
            .content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => message.content.to_string(),
    };
    Message {
        role: message.role,
        content: vec![ContentBlock::text(text)],
    }
}

fn to_mcp_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "endTurn".to_string(),
        "max_tokens" => "maxTokens".to_string(),
        "stop_sequence" => "stopSequence".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::inference::{CreateMessageResponse, InferenceError, LlmProvider};

    struct EchoProvider {
        seen: Mutex<Vec<CreateMessageRequest>>,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }

        async fn create_message(
            &self,
            request: CreateMessageRequest,
        ) -> Result<CreateMessageResponse, InferenceError> {
            let last = match request.messages.last().and_then(|m| m.content.first()) {
                Some(ContentBlock::Text { text }) => text.clone(),
                _ => String::new(),
            };
            self.seen.lock().unwrap().push(request);
            Ok(CreateMessageResponse {
                content: vec![ContentBlock::text(format!("echo: {last}"))],
                stop_reason: Some("end_turn".into()),
                model: None,
            })
        }
    }

    fn sampler() -> (ProviderSampler, Arc<EchoProvider>) {
        let provider = Arc::new(EchoProvider {
            seen: Mutex::new(Vec::new()),
        });
        let mut providers = ProviderSet::new();
        providers.insert(provider.clone());
        (ProviderSampler::new(providers, "echo", None), provider)
    }

    fn params() -> Value {
        json!({
            "messages": [
                { "role": "user", "content": { "type": "text", "text": "hello" } }
            ],
            "systemPrompt": "be nice",
            "maxTokens": 64
        })
    }

    #[tokio::test]
    async fn test_answers_with_provider() {
        let (sampler, provider) = sampler();
        let result = sampler
            .create_message("srv", params(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result["role"], "assistant");
        assert_eq!(result["content"]["text"], "echo: hello");
        assert_eq!(result["model"], "echo-1");
        assert_eq!(result["stopReason"], "endTurn");

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].max_tokens, 64);
        assert_eq!(seen[0].system.as_deref(), Some("be nice"));
    }

    #[tokio::test]
    async fn test_rejected_sampling_is_error() {
        let (sampler, provider) = sampler();
        let (broker, mut announcements) = ApprovalBroker::new();
        let sampler = sampler.with_approvals(broker.clone());

        let rejecter = tokio::spawn(async move {
            let pending = announcements.recv().await.unwrap();
            assert_eq!(pending.kind, ApprovalKind::Sampling);
            assert_eq!(pending.tool_name, "srv");
            broker.reject(&pending.id);
        });

        let err = sampler
            .create_message("srv", params(), CancellationToken::new())
            .await
            .unwrap_err();
        rejecter.await.unwrap();

        assert_eq!(err.code, error_codes::USER_REJECTED);
        assert!(provider.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let (sampler, _) = sampler();
        let err = sampler
            .create_message("srv", json!({ "nope": true }), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let sampler = ProviderSampler::new(ProviderSet::new(), "anthropic", None);
        let err = sampler
            .create_message("srv", params(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert!(err.message.contains("anthropic"));
    }
}

//! Anthropic Messages API provider.
//!
//! The provider-neutral request already has the Messages API shape, so it is
//! sent as-is; only the response needs filtering down to the block types the
//! agent loop understands.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;

use super::errors::InferenceError;
use super::provider::{build_http_client, LlmProvider, ANTHROPIC, REQUEST_TIMEOUT};
use super::types::{ContentBlock, CreateMessageRequest, CreateMessageResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: HttpClient,
    api_key: String,
    endpoint: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self, InferenceError> {
        let base = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let endpoint = format!("{}/v1/messages", base.trim_end_matches('/'));
        Ok(Self {
            http: build_http_client(&endpoint)?,
            api_key,
            endpoint,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        ANTHROPIC
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResponse, InferenceError> {
        tracing::debug!(
            provider = ANTHROPIC,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending messages request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                InferenceError::from_reqwest(&self.endpoint, REQUEST_TIMEOUT.as_secs(), e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| InferenceError::InvalidResponse {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(http_error(status.as_u16(), &body));
        }
        parse_response(&body)
    }
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Thinking and other block types are not fed back to the loop.
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn parse_response(body: &str) -> Result<CreateMessageResponse, InferenceError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
            reason: format!("failed to parse messages response: {e}"),
        })?;

    let content = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            ResponseBlock::Other => None,
        })
        .collect();

    Ok(CreateMessageResponse {
        content,
        stop_reason: response.stop_reason,
        model: response.model,
    })
}

/// Prefer the structured `{error: {type, message}}` body when present.
fn http_error(status: u16, body: &str) -> InferenceError {
    let body = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => format!("{}: {}", parsed.error.kind, parsed.error.message),
        Err(_) => body.to_string(),
    };
    InferenceError::HttpError { status, body }
}

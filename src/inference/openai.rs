//! OpenAI-compatible Chat Completions provider.
//!
//! Serves both the hosted OpenAI API and local runtimes that speak the same
//! protocol (Ollama, llama.cpp, vLLM). Content blocks are translated to and
//! from the `tool_calls` / `tool` role message pattern.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::InferenceError;
use super::provider::{build_http_client, LlmProvider, OLLAMA, OPENAI, REQUEST_TIMEOUT};
use super::types::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, Message, Role, ToolDefinition,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const OLLAMA_DEFAULT_MODEL: &str = "llama3.1";

pub struct OpenAiProvider {
    name: &'static str,
    http: HttpClient,
    api_key: Option<String>,
    endpoint: String,
    model: String,
}

impl OpenAiProvider {
    /// Hosted OpenAI (or any compatible endpoint that needs a key).
    pub fn openai(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self, InferenceError> {
        Self::build(
            OPENAI,
            Some(api_key),
            base_url.as_deref().unwrap_or(OPENAI_BASE_URL),
            model.unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
        )
    }

    /// Local Ollama; no key.
    pub fn ollama(base_url: Option<String>, model: Option<String>) -> Result<Self, InferenceError> {
        Self::build(
            OLLAMA,
            None,
            base_url.as_deref().unwrap_or(OLLAMA_BASE_URL),
            model.unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_string()),
        )
    }

    fn build(
        name: &'static str,
        api_key: Option<String>,
        base_url: &str,
        model: String,
    ) -> Result<Self, InferenceError> {
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            name,
            http: build_http_client(&endpoint)?,
            api_key,
            endpoint,
            model,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResponse, InferenceError> {
        let body = to_wire_request(request);
        tracing::debug!(
            provider = self.name,
            model = %body.model,
            messages = body.messages.len(),
            "sending chat completion request"
        );

        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            InferenceError::from_reqwest(&self.endpoint, REQUEST_TIMEOUT.as_secs(), e)
        })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| InferenceError::InvalidResponse {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        parse_response(&body_text)
    }
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// A single message in the Chat Completions conversation.
///
/// `content` must be `""` (not `null`) for assistant messages with tool
/// calls; local runtimes mishandle `null` there.
#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: ChatRole,
    #[serde(serialize_with = "serialize_content")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments object.
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// Request body for `POST {base}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

// ─── Translation ─────────────────────────────────────────────────────────────

fn to_wire_request(request: CreateMessageRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system {
        messages.push(ChatMessage {
            role: ChatRole::System,
            content: Some(system),
            tool_call_id: None,
            tool_calls: None,
        });
    }
    for message in request.messages {
        push_wire_messages(&mut messages, message);
    }

    ChatCompletionRequest {
        model: request.model,
        messages,
        tools: request.tools.into_iter().map(to_wire_tool).collect(),
        max_tokens: request.max_tokens,
        stream: false,
    }
}

/// One neutral message can become several wire messages: each tool result
/// is its own `tool` message, and must precede any user text that follows.
fn push_wire_messages(out: &mut Vec<ChatMessage>, message: Message) {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in message.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(WireToolCall {
                id: Some(id),
                kind: function_type(),
                function: WireFunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => out.push(ChatMessage {
                role: ChatRole::Tool,
                content: Some(if is_error {
                    format!("Error: {content}")
                } else {
                    content
                }),
                tool_call_id: Some(tool_use_id),
                tool_calls: None,
            }),
        }
    }

    let text = (!texts.is_empty()).then(|| texts.join("\n"));
    match message.role {
        Role::Assistant => out.push(ChatMessage {
            role: ChatRole::Assistant,
            content: text,
            tool_call_id: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        }),
        Role::User => {
            if text.is_some() {
                out.push(ChatMessage {
                    role: ChatRole::User,
                    content: text,
                    tool_call_id: None,
                    tool_calls: None,
                });
            }
        }
    }
}

fn to_wire_tool(tool: ToolDefinition) -> WireTool {
    WireTool {
        kind: "function",
        function: WireFunction {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        },
    }
}

fn parse_response(body: &str) -> Result<CreateMessageResponse, InferenceError> {
    let response: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
            reason: format!("failed to parse chat completion: {e}"),
        })?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::InvalidResponse {
            reason: "empty choices array".into(),
        })?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content.filter(|c| !c.is_empty()) {
        content.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input = parse_arguments(&call.function.arguments)?;
        content.push(ContentBlock::ToolUse {
            id: call.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            name: call.function.name,
            input,
        });
    }

    let stop_reason = choice.finish_reason.map(|reason| match reason.as_str() {
        "tool_calls" => "tool_use".to_string(),
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        _ => reason,
    });

    Ok(CreateMessageResponse {
        content,
        stop_reason,
        model: response.model,
    })
}

/// Arguments arrive JSON-encoded; an empty string means no arguments.
fn parse_arguments(raw: &str) -> Result<serde_json::Value, InferenceError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| InferenceError::ToolCallParseError {
            raw_arguments: raw.to_string(),
            reason: e.to_string(),
        })?;
    if !value.is_object() {
        return Err(InferenceError::ToolCallParseError {
            raw_arguments: raw.to_string(),
            reason: "arguments are not a JSON object".into(),
        });
    }
    Ok(value)
}

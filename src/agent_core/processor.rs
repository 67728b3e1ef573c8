//! QueryProcessor: the bounded think/act loop.
//!
//! One query becomes a sequence of provider calls. Every tool-use block in a
//! response is approved, executed through a [`ToolCaller`], and fed back as
//! a tool result; the loop ends when a response asks for no tools, when the
//! iteration ceiling is reached, or when the caller cancels.
//!
//! Cancellation is checked before and after every provider call and every
//! tool execution. Tool failures never end the loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::inference::{
    ContentBlock, CreateMessageRequest, LlmProvider, Message, ProviderSet, ToolDefinition,
};
use crate::mcp_client::types::CallToolResult;
use crate::mcp_client::{ConnectionRegistry, McpError, Tool};

use super::errors::AgentError;
use super::sanitize::{sanitize_tool, RenameMap};

// ─── Constants ──────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_ITERATIONS: usize = 50;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Longest argument rendering shown in a streamed tool-call line.
const MAX_ARGS_PREVIEW: usize = 500;

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Executes a tool by name wherever it lives.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, McpError>;
}

/// Decides whether a tool call may run.
#[async_trait]
pub trait ToolCallApprover: Send + Sync {
    async fn request_tool_call_approval(&self, name: &str, input: &Value, id: &str) -> bool;
}

#[async_trait]
impl ToolCaller for ConnectionRegistry {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, McpError> {
        let options = self.call_options().with_cancel(cancel);
        ConnectionRegistry::call_tool(self, name, arguments, Some(options)).await
    }
}

// ─── Settings / Options ─────────────────────────────────────────────────────

/// Loop defaults, usually from the `agent:` config section.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Provider used when a query does not name one.
    pub provider: String,
    /// Model override; otherwise the provider's default model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: crate::inference::provider::ANTHROPIC.to_string(),
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
        }
    }
}

/// Receives streamed output lines as they are produced.
pub type UpdateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-query options.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cancel: CancellationToken,
    pub on_update: Option<UpdateCallback>,
}

impl QueryOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_updates(mut self, callback: UpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without asking for tools.
    Completed,
    /// The iteration ceiling was reached.
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Every streamed line, joined by newlines.
    pub final_text: String,
    pub messages: Vec<Message>,
    /// Provider calls made.
    pub iterations: usize,
    pub stop_reason: StopReason,
}

/// Per-query mutable state. Owned by one `process_query` call.
struct QueryContext {
    messages: Vec<Message>,
    output: Vec<String>,
    on_update: Option<UpdateCallback>,
    cancel: CancellationToken,
}

impl QueryContext {
    fn emit(&mut self, line: String) {
        if let Some(ref on_update) = self.on_update {
            on_update(&line);
        }
        self.output.push(line);
    }

    fn cancelled(&self) -> AgentError {
        AgentError::Cancelled {
            partial_output: self.output.join("\n"),
        }
    }

    fn checkpoint(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        Ok(())
    }
}

// ─── QueryProcessor ─────────────────────────────────────────────────────────

pub struct QueryProcessor {
    providers: ProviderSet,
    tool_caller: Arc<dyn ToolCaller>,
    approver: Option<Arc<dyn ToolCallApprover>>,
    settings: AgentSettings,
}

impl QueryProcessor {
    pub fn new(
        providers: ProviderSet,
        tool_caller: Arc<dyn ToolCaller>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            providers,
            tool_caller,
            approver: None,
            settings,
        }
    }

    /// Without an approver every tool call is auto-approved.
    pub fn with_approver(mut self, approver: Arc<dyn ToolCallApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run one query against `tools` until the model stops asking for them.
    pub async fn process_query(
        &self,
        query: &str,
        tools: &[Tool],
        options: QueryOptions,
    ) -> Result<QueryOutcome, AgentError> {
        let provider = self.resolve_provider(options.provider.as_deref())?;
        let model = options
            .model
            .clone()
            .or_else(|| self.settings.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());

        let mut definitions: Vec<ToolDefinition> = Vec::with_capacity(tools.len());
        let mut renames: HashMap<String, RenameMap> = HashMap::new();
        for tool in tools {
            // Calls route to the first server advertising a name.
            if definitions.iter().any(|d| d.name == tool.name) {
                continue;
            }
            let sanitized = sanitize_tool(tool);
            if !sanitized.renames.is_identity() {
                renames.insert(tool.name.clone(), sanitized.renames);
            }
            definitions.push(sanitized.definition);
        }

        let mut ctx = QueryContext {
            messages: vec![Message::user_text(query)],
            output: Vec::new(),
            on_update: options.on_update.clone(),
            cancel: options.cancel.clone(),
        };

        tracing::info!(
            provider = provider.name(),
            model = %model,
            tools = definitions.len(),
            "query started"
        );

        let mut iterations = 0;
        let stop_reason = loop {
            ctx.checkpoint()?;
            if iterations >= self.settings.max_iterations {
                ctx.emit(format!(
                    "[Warning: Reached maximum iterations ({}). Stopping to prevent infinite loop.]",
                    self.settings.max_iterations
                ));
                tracing::warn!(iterations, "query hit the iteration ceiling");
                break StopReason::MaxIterations;
            }
            iterations += 1;

            let request = CreateMessageRequest {
                model: model.clone(),
                max_tokens: self.settings.max_tokens,
                messages: ctx.messages.clone(),
                tools: definitions.clone(),
                system: self.settings.system_prompt.clone(),
            };
            let response = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ctx.cancelled()),
                response = provider.create_message(request) => response,
            };
            ctx.checkpoint()?;
            let response = response?;
            tracing::debug!(
                iteration = iterations,
                blocks = response.content.len(),
                stop_reason = ?response.stop_reason,
                "model responded"
            );

            ctx.messages.push(Message::assistant(response.content.clone()));

            let mut results = Vec::new();
            for block in response.content {
                match block {
                    ContentBlock::Text { text } => ctx.emit(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        let result = self
                            .run_tool(&mut ctx, &id, &name, input, renames.get(&name))
                            .await?;
                        results.push(result);
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }

            if results.is_empty() {
                break StopReason::Completed;
            }
            ctx.messages.push(Message::user(results));
        };

        tracing::info!(iterations, stop_reason = ?stop_reason, "query finished");
        Ok(QueryOutcome {
            final_text: ctx.output.join("\n"),
            messages: ctx.messages,
            iterations,
            stop_reason,
        })
    }

    fn resolve_provider(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>, AgentError> {
        let name = name.unwrap_or(&self.settings.provider);
        self.providers
            .get(name)
            .ok_or_else(|| AgentError::UnknownProvider {
                name: name.to_string(),
                available: self.providers.names(),
            })
    }

    /// Approve and execute one tool call, producing its `tool_result` block.
    async fn run_tool(
        &self,
        ctx: &mut QueryContext,
        id: &str,
        name: &str,
        input: Value,
        renames: Option<&RenameMap>,
    ) -> Result<ContentBlock, AgentError> {
        if let Some(ref approver) = self.approver {
            let approved = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => false,
                approved = approver.request_tool_call_approval(name, &input, id) => approved,
            };
            ctx.checkpoint()?;
            if !approved {
                ctx.emit(format!("[Tool {name} rejected by user]"));
                tracing::info!(tool = name, "tool call rejected");
                return Ok(ContentBlock::tool_result(
                    id,
                    "Tool call rejected by user",
                    true,
                ));
            }
        }

        ctx.emit(format!(
            "[Calling tool {name} with args {}]",
            preview_args(&input)
        ));

        let arguments = match renames {
            Some(renames) => renames.restore(input),
            None => input,
        };

        ctx.checkpoint()?;
        let result = self
            .tool_caller
            .call_tool(name, arguments, ctx.cancel.clone())
            .await;
        ctx.checkpoint()?;

        match result {
            Ok(result) => {
                tracing::debug!(tool = name, is_error = result.is_error, "tool returned");
                Ok(ContentBlock::tool_result(
                    id,
                    render_tool_result(&result),
                    result.is_error,
                ))
            }
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool call failed");
                ctx.emit(format!("[Tool {name} failed: {e}]"));
                Ok(ContentBlock::tool_result(id, format!("Error: {e}"), true))
            }
        }
    }
}

/// Text content joined by newlines; the raw JSON when there is none.
fn render_tool_result(result: &CallToolResult) -> String {
    match result.text() {
        Some(text) => text,
        None => serde_json::to_string(result).unwrap_or_default(),
    }
}

fn preview_args(input: &Value) -> String {
    let rendered = input.to_string();
    if rendered.len() <= MAX_ARGS_PREVIEW {
        return rendered;
    }
    let mut end = MAX_ARGS_PREVIEW;
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &rendered[..end])
}

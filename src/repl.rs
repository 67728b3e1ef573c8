//! Interactive loop: a line-oriented front end for the registry and the
//! agent loop.
//!
//! Slash commands inspect and manage servers; any other line runs a query
//! over every cached tool. While a query runs, streamed output is written as
//! it arrives, approval prompts read `y`/`n` from the same input, and an
//! interrupt cancels the query while keeping what was already printed.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_core::{
    AgentError, ApprovalBroker, ApprovalKind, PendingApproval, QueryOptions, QueryProcessor,
    StopReason,
};
use crate::mcp_client::{ConnectionRegistry, ServerEvent, Tool};

const HELP: &str = "\
Commands:
  /help                 Show this help
  /servers              List configured servers and their status
  /tools                List tools of connected servers
  /connect <name>       Connect to a server
  /disconnect <name>    Disconnect from a server
  /history <name>       Show the request history of a server
  /quit                 Exit
Anything else is sent to the model as a query.";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Servers,
    Tools,
    Connect(String),
    Disconnect(String),
    History(String),
    Quit,
    Query(String),
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Query(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let needs_arg = |build: fn(String) -> Command| {
        if arg.is_empty() {
            Command::Invalid(format!("/{name} needs a server name"))
        } else {
            build(arg.to_string())
        }
    };

    match name {
        "help" | "?" => Command::Help,
        "servers" => Command::Servers,
        "tools" => Command::Tools,
        "connect" => needs_arg(Command::Connect),
        "disconnect" => needs_arg(Command::Disconnect),
        "history" => needs_arg(Command::History),
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command: /{other} (try /help)")),
    }
}

/// Approvals wired into the loop: the broker plus its announcements.
pub struct ApprovalPrompts {
    pub broker: ApprovalBroker,
    pub announcements: mpsc::UnboundedReceiver<PendingApproval>,
}

pub struct InteractiveLoop<R, W> {
    registry: Arc<ConnectionRegistry>,
    processor: Arc<QueryProcessor>,
    approvals: Option<ApprovalPrompts>,
    interrupts: mpsc::Receiver<()>,
    input: Lines<R>,
    output: W,
}

impl<R, W> InteractiveLoop<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        processor: Arc<QueryProcessor>,
        input: R,
        output: W,
        interrupts: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            processor,
            approvals: None,
            interrupts,
            input: input.lines(),
            output,
        }
    }

    /// Prompt on the same input for every pending approval.
    pub fn with_approvals(mut self, approvals: ApprovalPrompts) -> Self {
        self.approvals = Some(approvals);
        self
    }

    /// Run until `/quit`, end of input, or an interrupt while idle.
    pub async fn run(mut self) -> std::io::Result<()> {
        let refresher = spawn_tool_refresher(Arc::clone(&self.registry));
        self.write_line("mcpscope: type /help for commands").await?;

        loop {
            self.output.write_all(b"> ").await?;
            self.output.flush().await?;

            let approvals = self.approvals.as_mut().map(|a| &mut a.announcements);
            let line = tokio::select! {
                line = self.input.next_line() => line?,
                Some(()) = self.interrupts.recv() => None,
                Some(pending) = recv_pending(approvals) => {
                    // Sampling requests can arrive with no query running.
                    self.prompt_approval(pending).await?;
                    continue;
                }
            };
            let Some(line) = line else {
                break;
            };

            match parse_command(&line) {
                Command::Empty => {}
                Command::Quit => break,
                Command::Help => self.write_line(HELP).await?,
                Command::Servers => self.show_servers().await?,
                Command::Tools => self.show_tools().await?,
                Command::Connect(name) => self.connect(&name).await?,
                Command::Disconnect(name) => self.disconnect(&name).await?,
                Command::History(name) => self.show_history(&name).await?,
                Command::Invalid(message) => self.write_line(&message).await?,
                Command::Query(query) => self.run_query(&query).await?,
            }
        }

        refresher.abort();
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.output.write_all(line.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await
    }

    // ─── Commands ───────────────────────────────────────────────────────

    async fn show_servers(&mut self) -> std::io::Result<()> {
        let names = self.registry.server_names().await;
        if names.is_empty() {
            return self.write_line("No servers configured.").await;
        }
        for name in names {
            let status = self
                .registry
                .connection_status(&name)
                .await
                .map(|s| s.to_string())
                .unwrap_or_default();
            let transport = self
                .registry
                .server_config(&name)
                .await
                .map(|c| c.transport_label().to_string())
                .unwrap_or_default();
            self.write_line(&format!("  {name:<20} {status:<26} {transport}"))
                .await?;
        }
        let overall = self.registry.get_overall_connection_status().await;
        self.write_line(&format!("Overall: {overall}")).await
    }

    async fn show_tools(&mut self) -> std::io::Result<()> {
        let all = self.registry.get_all_tools().await;
        if all.is_empty() {
            return self.write_line("No connected servers.").await;
        }
        for (server, tools) in all {
            self.write_line(&format!("{server} ({} tools)", tools.len()))
                .await?;
            for tool in tools {
                let description = tool.description.as_deref().unwrap_or("");
                self.write_line(&format!("  {:<28} {description}", tool.name))
                    .await?;
            }
        }
        Ok(())
    }

    async fn connect(&mut self, name: &str) -> std::io::Result<()> {
        match self.registry.connect_to_server(name).await {
            Ok(client) => {
                let info = client
                    .server_info()
                    .await
                    .map(|i| format!(" ({} {})", i.name, i.version))
                    .unwrap_or_default();
                self.write_line(&format!("Connected to {name}{info}")).await
            }
            Err(e) => self.write_line(&format!("Failed to connect to {name}: {e}")).await,
        }
    }

    async fn disconnect(&mut self, name: &str) -> std::io::Result<()> {
        match self.registry.disconnect_from_server(name).await {
            Ok(()) => self.write_line(&format!("Disconnected from {name}")).await,
            Err(e) => self.write_line(&format!("{e}")).await,
        }
    }

    async fn show_history(&mut self, name: &str) -> std::io::Result<()> {
        let Some(client) = self.registry.client(name).await else {
            return self.write_line(&format!("No client for {name}")).await;
        };
        let entries = client.history();
        if entries.is_empty() {
            return self.write_line("No requests yet.").await;
        }
        for entry in entries {
            let method = entry
                .request
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or("?");
            let latency = entry
                .latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".into());
            let outcome = match (&entry.error, &entry.response) {
                (Some(error), _) => format!("error: {error}"),
                (None, Some(_)) => "ok".into(),
                (None, None) => "sent".into(),
            };
            self.write_line(&format!(
                "  {} {method:<28} {latency:>8} {outcome}",
                entry.timestamp.format("%H:%M:%S%.3f")
            ))
            .await?;
        }
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Run one query to completion, streaming its output.
    pub async fn run_query(&mut self, query: &str) -> std::io::Result<()> {
        let tools = flatten_tools(self.registry.get_all_tools().await);
        let cancel = CancellationToken::new();
        let (updates_tx, mut updates) = mpsc::unbounded_channel::<String>();
        let options = QueryOptions::default()
            .with_cancel(cancel.clone())
            .with_updates(Arc::new(move |line: &str| {
                let _ = updates_tx.send(line.to_string());
            }));

        let processor = Arc::clone(&self.processor);
        let query = query.to_string();
        let mut task: JoinHandle<Result<_, AgentError>> =
            tokio::spawn(async move { processor.process_query(&query, &tools, options).await });

        let joined = loop {
            let approvals = self.approvals.as_mut().map(|a| &mut a.announcements);
            tokio::select! {
                biased;
                Some(line) = updates.recv() => {
                    self.write_line(&line).await?;
                }
                Some(()) = self.interrupts.recv() => {
                    cancel.cancel();
                    self.write_line("^C cancelling...").await?;
                }
                Some(pending) = recv_pending(approvals) => {
                    self.prompt_approval(pending).await?;
                }
                joined = &mut task => break joined,
            }
        };

        while let Ok(line) = updates.try_recv() {
            self.write_line(&line).await?;
        }

        match joined {
            Ok(Ok(outcome)) => {
                if outcome.stop_reason == StopReason::MaxIterations {
                    tracing::warn!(iterations = outcome.iterations, "query stopped at ceiling");
                }
                Ok(())
            }
            Ok(Err(AgentError::Cancelled { .. })) => self.write_line("[Query cancelled]").await,
            Ok(Err(e)) => self.write_line(&format!("Error: {e}")).await,
            Err(e) => self.write_line(&format!("Error: query task failed: {e}")).await,
        }
    }

    async fn prompt_approval(&mut self, pending: PendingApproval) -> std::io::Result<()> {
        let question = match pending.kind {
            ApprovalKind::ToolCall => format!(
                "Allow tool {} with args {}? [y/N] ",
                pending.tool_name, pending.input
            ),
            ApprovalKind::Sampling => format!(
                "Server {} requests a model completion. Allow? [y/N] ",
                pending.tool_name
            ),
        };
        self.output.write_all(question.as_bytes()).await?;
        self.output.flush().await?;

        let answer = self.input.next_line().await?.unwrap_or_default();
        let approved = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
        if let Some(ref approvals) = self.approvals {
            approvals.broker.resolve(&pending.id, approved);
        }
        Ok(())
    }
}

/// Pending approvals, or never when approvals are off.
async fn recv_pending(
    announcements: Option<&mut mpsc::UnboundedReceiver<PendingApproval>>,
) -> Option<PendingApproval> {
    match announcements {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Flatten per-server tool lists; later duplicates of a name are dropped
/// since calls route to the first server advertising it.
pub fn flatten_tools(all: Vec<(String, Vec<Tool>)>) -> Vec<Tool> {
    let mut tools: Vec<Tool> = Vec::new();
    for (_, server_tools) in all {
        for tool in server_tools {
            if !tools.iter().any(|t| t.name == tool.name) {
                tools.push(tool);
            }
        }
    }
    tools
}

/// Keep each server's tool cache current when it announces a change.
pub fn spawn_tool_refresher(registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ToolsListChanged { server }) => {
                    if let Err(e) = registry.refresh_tools(&server).await {
                        tracing::warn!(server = %server, error = %e, "tool refresh failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "server events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::agent_core::{AgentSettings, ToolCaller};
    use crate::inference::{
        ContentBlock, CreateMessageRequest, CreateMessageResponse, InferenceError, LlmProvider,
        ProviderSet,
    };
    use crate::mcp_client::testing::{tool, FakeServer, StubConnector};
    use crate::mcp_client::types::CallToolResult;
    use crate::mcp_client::{ClientHooks, ClientSettings, Connector, McpError, ServerConfig};

    /// Asks for `echo` once, then answers with text.
    struct EchoOnceProvider {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl LlmProvider for EchoOnceProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-1"
        }

        async fn create_message(
            &self,
            _request: CreateMessageRequest,
        ) -> Result<CreateMessageResponse, InferenceError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            let content = if *calls == 1 {
                vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "echo".into(),
                    input: json!({ "text": "hi" }),
                }]
            } else {
                vec![ContentBlock::text("all done")]
            };
            Ok(CreateMessageResponse {
                content,
                ..Default::default()
            })
        }
    }

    struct NeverCalled;

    #[async_trait]
    impl ToolCaller for NeverCalled {
        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<CallToolResult, McpError> {
            Err(McpError::ToolNotFound { name: name.into() })
        }
    }

    async fn fixture() -> (Arc<ConnectionRegistry>, Arc<StubConnector>) {
        let connector = Arc::new(StubConnector::new());
        connector.serve("everything", FakeServer::with_tools(&["echo"]));
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            None,
            ClientSettings::default(),
            ClientHooks::default(),
        ));
        registry
            .add_server("everything", ServerConfig::stdio("npx", &["everything"]))
            .await;
        (registry, connector)
    }

    fn processor(caller: Arc<dyn ToolCaller>) -> Arc<QueryProcessor> {
        let mut providers = ProviderSet::new();
        providers.insert(Arc::new(EchoOnceProvider {
            calls: Mutex::new(0),
        }));
        Arc::new(QueryProcessor::new(
            providers,
            caller,
            AgentSettings {
                provider: "scripted".into(),
                ..Default::default()
            },
        ))
    }

    async fn run_script(
        registry: Arc<ConnectionRegistry>,
        processor: Arc<QueryProcessor>,
        script: &str,
        approvals: Option<ApprovalPrompts>,
    ) -> String {
        let (_interrupt_tx, interrupts) = mpsc::channel(1);
        let mut output = Vec::new();
        let mut repl = InteractiveLoop::new(
            registry,
            processor,
            script.as_bytes(),
            &mut output,
            interrupts,
        );
        if let Some(approvals) = approvals {
            repl = repl.with_approvals(approvals);
        }
        repl.run().await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  "), Command::Empty);
        assert_eq!(parse_command("/help"), Command::Help);
        assert_eq!(parse_command("/connect  files "), Command::Connect("files".into()));
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("what time is it?"), Command::Query("what time is it?".into()));
        assert!(matches!(parse_command("/connect"), Command::Invalid(_)));
        assert!(matches!(parse_command("/frobnicate"), Command::Invalid(_)));
    }

    #[test]
    fn test_flatten_tools_keeps_first_duplicate() {
        let mut first = tool("search");
        first.description = Some("from a".into());
        let tools = flatten_tools(vec![
            ("a".into(), vec![first, tool("read")]),
            ("b".into(), vec![tool("search"), tool("write")]),
        ]);
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search", "read", "write"]);
        assert_eq!(tools[0].description.as_deref(), Some("from a"));
    }

    #[tokio::test]
    async fn test_connect_and_list_commands() {
        let (registry, _) = fixture().await;
        let processor = processor(Arc::new(NeverCalled));
        let output = run_script(
            Arc::clone(&registry),
            processor,
            "/servers\n/connect everything\n/tools\n/history everything\n/disconnect everything\n/quit\n",
            None,
        )
        .await;

        assert!(output.contains("everything"));
        assert!(output.contains("Connected to everything (fake 0.0.1)"));
        assert!(output.contains("echo"));
        assert!(output.contains("initialize"));
        assert!(output.contains("Disconnected from everything"));
        assert_eq!(
            registry.connection_status("everything").await,
            Some(crate::mcp_client::ConnectionStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_query_streams_tool_calls() {
        let (registry, _) = fixture().await;
        registry.connect_to_server("everything").await.unwrap();
        let caller: Arc<dyn ToolCaller> = Arc::clone(&registry) as Arc<dyn ToolCaller>;
        let output = run_script(registry, processor(caller), "say hi\n", None).await;

        assert!(output.contains(r#"[Calling tool echo with args {"text":"hi"}]"#));
        assert!(output.contains("all done"));
    }

    #[tokio::test]
    async fn test_query_with_rejected_approval() {
        let (registry, _) = fixture().await;
        registry.connect_to_server("everything").await.unwrap();
        let caller: Arc<dyn ToolCaller> = Arc::clone(&registry) as Arc<dyn ToolCaller>;
        let (broker, announcements) = ApprovalBroker::new();
        let processor = {
            let mut providers = ProviderSet::new();
            providers.insert(Arc::new(EchoOnceProvider {
                calls: Mutex::new(0),
            }));
            Arc::new(
                QueryProcessor::new(
                    providers,
                    caller,
                    AgentSettings {
                        provider: "scripted".into(),
                        ..Default::default()
                    },
                )
                .with_approver(Arc::new(broker.clone())),
            )
        };

        let output = run_script(
            registry,
            processor,
            "say hi\nn\n",
            Some(ApprovalPrompts {
                broker,
                announcements,
            }),
        )
        .await;

        assert!(output.contains("Allow tool echo"));
        assert!(output.contains("[Tool echo rejected by user]"));
        assert!(output.contains("all done"));
    }

    async fn read_until(output: &mut tokio::io::DuplexStream, marker: &str) -> String {
        use tokio::io::AsyncReadExt;

        let mut seen = String::new();
        let mut buf = [0u8; 256];
        while !seen.contains(marker) {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0, "output closed before {marker:?}: {seen}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        seen
    }

    #[tokio::test]
    async fn test_sampling_approval_prompted_while_idle() {
        let (registry, _) = fixture().await;
        let (broker, announcements) = ApprovalBroker::new();
        let (mut operator_in, repl_in) = tokio::io::duplex(4096);
        let (repl_out, mut operator_out) = tokio::io::duplex(4096);
        let (_interrupt_tx, interrupts) = mpsc::channel(1);

        let repl = InteractiveLoop::new(
            registry,
            processor(Arc::new(NeverCalled)),
            tokio::io::BufReader::new(repl_in),
            repl_out,
            interrupts,
        )
        .with_approvals(ApprovalPrompts {
            broker: broker.clone(),
            announcements,
        });
        let running = tokio::spawn(repl.run());
        read_until(&mut operator_out, "> ").await;

        let request = tokio::spawn(async move {
            let params = json!({ "messages": [] });
            broker
                .request(ApprovalKind::Sampling, "everything", &params, None)
                .await
        });
        let prompt = read_until(&mut operator_out, "Allow? [y/N]").await;
        assert!(prompt.contains("Server everything requests a model completion"));

        operator_in.write_all(b"y\n").await.unwrap();
        assert!(request.await.unwrap());

        operator_in.write_all(b"/quit\n").await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_command_and_eof() {
        let (registry, _) = fixture().await;
        let output = run_script(registry, processor(Arc::new(NeverCalled)), "/nope\n", None).await;
        assert!(output.contains("unknown command: /nope"));
    }
}

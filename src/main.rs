use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use mcpscope::agent_core::{
    ApprovalBroker, ProviderSampler, QueryProcessor, ToolCallApprover, ToolCaller,
};
use mcpscope::config::{self, ConfiguredRoots};
use mcpscope::inference::ProviderSet;
use mcpscope::mcp_client::{
    ClientHooks, ConnectionRegistry, Connector, CredentialProvider, ProxyConnector, TokenStore,
};
use mcpscope::repl::{ApprovalPrompts, InteractiveLoop};

/// Inspect MCP servers through the proxy and drive them with an LLM.
#[derive(Debug, Parser)]
#[command(name = "mcpscope", version)]
struct Cli {
    /// Config file (otherwise MCPSCOPE_CONFIG, ./mcpscope.yaml upward, data dir)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Proxy base URL
    #[arg(long, env = "MCPSCOPE_PROXY")]
    proxy: Option<String>,

    /// LLM provider: anthropic, openai or ollama
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Connect only these servers (repeatable)
    #[arg(long = "server", value_name = "NAME")]
    servers: Vec<String>,

    /// Run tools and answer sampling requests without asking
    #[arg(long)]
    auto_approve: bool,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,

    /// Run this query once and exit
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mcpscope::init_tracing(cli.log_stderr);

    let (mut config, config_path) = config::load(cli.config.as_deref())?;
    if let Some(path) = config_path {
        eprintln!("Using config {}", path.display());
    }
    if let Some(proxy) = cli.proxy {
        config.proxy.url = proxy;
    }
    if let Some(provider) = cli.provider {
        config.agent.provider = provider;
    }
    if cli.model.is_some() {
        config.agent.model = cli.model;
    }
    config.agent.auto_approve |= cli.auto_approve;

    if config.proxy.bootstrap {
        match config::fetch_bootstrap(&config.proxy.url, config.proxy.auth_token.as_deref()).await
        {
            Ok(bootstrap) => config.apply_bootstrap(bootstrap),
            Err(e) => tracing::warn!(error = %e, "proxy bootstrap skipped"),
        }
    }

    for name in &cli.servers {
        if !config.servers.contains_key(name) {
            bail!("unknown server '{name}'");
        }
    }

    let providers = ProviderSet::from_config(&config.providers)
        .context("failed to set up LLM providers")?;
    let agent_settings = config.agent_settings();

    let approvals = if config.agent.auto_approve {
        None
    } else {
        Some(ApprovalBroker::new())
    };

    let mut sampler = ProviderSampler::new(
        providers.clone(),
        agent_settings.provider.clone(),
        agent_settings.model.clone(),
    );
    if let Some((ref broker, _)) = approvals {
        sampler = sampler.with_approvals(broker.clone());
    }
    let hooks = ClientHooks {
        sampling: Some(Arc::new(sampler)),
        roots: Some(ConfiguredRoots::new(config.roots.clone())),
        notifications: None,
    };

    let connector = ProxyConnector::new(&config.proxy.url, config.proxy.auth_token.clone())?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(TokenStore::new());
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(connector) as Arc<dyn Connector>,
        Some(credentials),
        config.client_settings(),
        hooks,
    ));
    for (name, server) in &config.servers {
        registry.add_server(name, server.clone()).await;
    }

    if cli.servers.is_empty() {
        for (name, e) in registry.connect_to_all_servers().await {
            eprintln!("Failed to connect to {name}: {e}");
        }
    } else {
        for name in &cli.servers {
            if let Err(e) = registry.connect_to_server(name).await {
                eprintln!("Failed to connect to {name}: {e}");
            }
        }
    }

    let mut processor = QueryProcessor::new(
        providers,
        Arc::clone(&registry) as Arc<dyn ToolCaller>,
        agent_settings,
    );
    if let Some((ref broker, _)) = approvals {
        processor = processor.with_approver(Arc::new(broker.clone()) as Arc<dyn ToolCallApprover>);
    }

    let (interrupt_tx, interrupts) = mpsc::channel(1);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut repl = InteractiveLoop::new(
        Arc::clone(&registry),
        Arc::new(processor),
        stdin,
        tokio::io::stdout(),
        interrupts,
    );
    if let Some((broker, announcements)) = approvals {
        repl = repl.with_approvals(ApprovalPrompts {
            broker,
            announcements,
        });
    }

    if cli.query.is_empty() {
        repl.run().await?;
    } else {
        repl.run_query(&cli.query.join(" ")).await?;
    }

    registry.disconnect_from_all_servers().await;
    tracing::info!("=== mcpscope exiting ===");
    Ok(())
}

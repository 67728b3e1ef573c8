//! Configuration loading.
//!
//! Reads `mcpscope.yaml` and resolves environment variables (`${VAR}` and
//! `${VAR:-default}`, with `~` expansion in defaults). A missing file yields
//! the defaults. The proxy's `/config` endpoint can pre-declare servers and
//! default environment variables; local entries always win.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent_core::AgentSettings;
use crate::inference::ProvidersConfig;
use crate::mcp_client::types::{HttpTransportKind, StdioConfig};
use crate::mcp_client::{ClientSettings, Root, RootsProvider, ServerConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCPSCOPE_CONFIG";

/// File searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "mcpscope.yaml";

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    ParseFailed { path: String, reason: String },

    #[error("proxy bootstrap failed: {reason}")]
    BootstrapFailed { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub requests: RequestsSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub roots: Vec<Root>,
    /// Server name → configuration, in file order.
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_url")]
    pub url: String,
    /// Sent as `X-MCP-Proxy-Auth: Bearer {token}`.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Merge the proxy's `/config` on startup.
    #[serde(default = "default_true")]
    pub bootstrap: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            url: default_proxy_url(),
            auth_token: None,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsSection {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_total_timeout_ms")]
    pub max_total_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub reset_timeout_on_progress: bool,
}

impl Default for RequestsSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_total_timeout_ms: default_max_total_timeout_ms(),
            reset_timeout_on_progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_header_name")]
    pub header_name: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            header_name: default_header_name(),
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Skip tool-call and sampling approvals.
    #[serde(default)]
    pub auto_approve: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            system_prompt: None,
            auto_approve: false,
        }
    }
}

fn default_proxy_url() -> String {
    "http://localhost:6277".into()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_total_timeout_ms() -> u64 {
    60_000
}

fn default_header_name() -> String {
    "Authorization".into()
}

fn default_provider() -> String {
    crate::inference::provider::ANTHROPIC.into()
}

fn default_max_tokens() -> u32 {
    crate::agent_core::processor::DEFAULT_MAX_TOKENS
}

fn default_max_iterations() -> usize {
    crate::agent_core::processor::DEFAULT_MAX_ITERATIONS
}

impl Config {
    /// Settings shared by every MCP client.
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_millis(self.requests.timeout_ms),
            max_total_timeout: Duration::from_millis(self.requests.max_total_timeout_ms),
            reset_timeout_on_progress: self.requests.reset_timeout_on_progress,
            auth_header_name: self.auth.header_name.clone(),
            bearer_token: self.auth.bearer_token.clone(),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            provider: self.agent.provider.clone(),
            model: self.agent.model.clone(),
            max_tokens: self.agent.max_tokens,
            max_iterations: self.agent.max_iterations,
            system_prompt: self.agent.system_prompt.clone(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `explicit`, `$MCPSCOPE_CONFIG`, `mcpscope.yaml` walking upward from
/// `start`, then `{data_dir}/config.yaml`.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    let fallback = crate::data_dir().join("config.yaml");
    fallback.exists().then_some(fallback)
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw, &path.display().to_string())
}

/// Parse config text, interpolating environment variables first.
pub fn parse_config(raw: &str, origin: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

/// Find and load the config, or fall back to defaults when there is none.
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(explicit, &start) {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), servers = config.servers.len(), "config loaded");
            Ok((config, Some(path)))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

// ─── Proxy Bootstrap ─────────────────────────────────────────────────────────

/// Body of `GET {proxy}/config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyBootstrap {
    #[serde(default)]
    pub default_environment: HashMap<String, String>,
    #[serde(default)]
    pub default_command: Option<String>,
    #[serde(default)]
    pub default_args: Option<BootstrapArgs>,
    #[serde(default)]
    pub default_transport: Option<String>,
    #[serde(default)]
    pub default_server_url: Option<String>,
    /// Raw entries; each is validated on its own.
    #[serde(default)]
    pub servers: IndexMap<String, Value>,
}

/// `defaultArgs` arrives either space-joined or as a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BootstrapArgs {
    Joined(String),
    List(Vec<String>),
}

impl BootstrapArgs {
    fn into_vec(self) -> Vec<String> {
        match self {
            BootstrapArgs::Joined(joined) => {
                joined.split_whitespace().map(str::to_string).collect()
            }
            BootstrapArgs::List(list) => list,
        }
    }
}

/// Fetch the proxy's bootstrap document.
pub async fn fetch_bootstrap(
    proxy_url: &str,
    auth_token: Option<&str>,
) -> Result<ProxyBootstrap, ConfigError> {
    let url = format!("{}/config", proxy_url.trim_end_matches('/'));
    let http = reqwest::Client::builder()
        .timeout(BOOTSTRAP_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::BootstrapFailed {
            reason: e.to_string(),
        })?;

    let mut request = http.get(&url);
    if let Some(token) = auth_token {
        request = request.header(crate::mcp_client::transport::PROXY_AUTH_HEADER, format!("Bearer {token}"));
    }
    let response = request.send().await.map_err(|e| ConfigError::BootstrapFailed {
        reason: format!("{url}: {e}"),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ConfigError::BootstrapFailed {
            reason: format!("{url}: HTTP {}", status.as_u16()),
        });
    }
    response
        .json::<ProxyBootstrap>()
        .await
        .map_err(|e| ConfigError::BootstrapFailed {
            reason: format!("{url}: {e}"),
        })
}

impl Config {
    /// Merge a bootstrap document into this config.
    ///
    /// Default environment variables fill gaps in every stdio server's env.
    /// Bootstrap servers are added only under names the config lacks. A
    /// `default` server is synthesised when no servers exist at all.
    pub fn apply_bootstrap(&mut self, bootstrap: ProxyBootstrap) {
        for (name, raw) in bootstrap.servers {
            if self.servers.contains_key(&name) {
                continue;
            }
            match serde_json::from_value::<ServerConfig>(raw) {
                Ok(config) => {
                    self.servers.insert(name, config);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "ignoring invalid bootstrap server");
                }
            }
        }

        if self.servers.is_empty() {
            if let Some(config) = default_server(
                bootstrap.default_command,
                bootstrap.default_args,
                bootstrap.default_transport.as_deref(),
                bootstrap.default_server_url,
            ) {
                self.servers.insert("default".into(), config);
            }
        }

        for config in self.servers.values_mut() {
            if let ServerConfig::Stdio(stdio) = config {
                for (key, value) in &bootstrap.default_environment {
                    stdio
                        .env
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }
}

fn default_server(
    command: Option<String>,
    args: Option<BootstrapArgs>,
    transport: Option<&str>,
    url: Option<String>,
) -> Option<ServerConfig> {
    let command = command.filter(|c| !c.is_empty());
    let url = url.filter(|u| !u.is_empty());
    match (transport, command, url) {
        (Some("sse"), _, Some(url)) => Some(ServerConfig::http(&url, HttpTransportKind::Sse)),
        (Some("streamable-http"), _, Some(url)) => {
            Some(ServerConfig::http(&url, HttpTransportKind::StreamableHttp))
        }
        (_, Some(command), _) => Some(ServerConfig::Stdio(StdioConfig {
            command,
            args: args.map(BootstrapArgs::into_vec).unwrap_or_default(),
            env: HashMap::new(),
        })),
        (_, None, Some(url)) => Some(ServerConfig::http(&url, HttpTransportKind::StreamableHttp)),
        (_, None, None) => None,
    }
}

// ─── Roots ───────────────────────────────────────────────────────────────────

/// Answers `roots/list` from the `roots:` section.
pub struct ConfiguredRoots {
    roots: Vec<Root>,
}

impl ConfiguredRoots {
    pub fn new(roots: Vec<Root>) -> Arc<Self> {
        Arc::new(Self { roots })
    }
}

#[async_trait]
impl RootsProvider for ConfiguredRoots {
    async fn list_roots(&self) -> Vec<Root> {
        self.roots.clone()
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

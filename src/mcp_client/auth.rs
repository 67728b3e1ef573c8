//! Credentials for HTTP servers: OAuth tokens keyed by server URL.
//!
//! The browser side of the authorization-code flow lives outside this crate.
//! Whatever completes it deposits the token into `oauth_tokens.json`, where
//! [`TokenStore::authorize`] picks it up on the next connect attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Contract ───────────────────────────────────────────────────────────────

/// Result of an authorization attempt after a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A token is now available; the connect can be retried.
    Authorized,
    /// The user must visit this URL; a higher layer resumes afterwards.
    Redirect { authorization_url: String },
    /// No token could be obtained.
    Denied,
}

/// Source of bearer tokens for HTTP servers.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Stored access token for `server_url`, if any.
    async fn access_token(&self, server_url: &str) -> Option<String>;

    /// Try to obtain a token for `server_url` after the server answered 401.
    async fn authorize(&self, server_url: &str) -> AuthOutcome;

    /// Forget any token tied to `server_url`.
    async fn clear(&self, server_url: &str);
}

// ─── File-backed store ──────────────────────────────────────────────────────

/// A stored OAuth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// ISO 8601 timestamp when the token was stored.
    #[serde(default)]
    pub obtained_at: String,
}

/// On-disk format for `oauth_tokens.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTokens {
    version: u32,
    /// Server URL → token.
    tokens: HashMap<String, StoredToken>,
}

/// Token store persisted to the platform data directory.
pub struct TokenStore {
    tokens: Mutex<HashMap<String, StoredToken>>,
    persist_path: PathBuf,
}

impl TokenStore {
    /// Open the store at the default location and load existing tokens.
    pub fn new() -> Self {
        Self::at_path(crate::data_dir().join("oauth_tokens.json"))
    }

    /// Open a store backed by `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let persist_path = path.into();
        let tokens = load_tokens(&persist_path);
        Self {
            tokens: Mutex::new(tokens),
            persist_path,
        }
    }

    /// Store a token for `server_url` and persist it.
    pub fn save_token(&self, server_url: &str, access_token: &str) {
        let token = StoredToken {
            access_token: access_token.to_string(),
            refresh_token: None,
            obtained_at: chrono::Utc::now().to_rfc3339(),
        };
        let snapshot = {
            let mut tokens = self.lock();
            tokens.insert(server_url.to_string(), token);
            tokens.clone()
        };
        save_tokens(&self.persist_path, snapshot);
        tracing::info!(server_url, "oauth token stored");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for TokenStore {
    async fn access_token(&self, server_url: &str) -> Option<String> {
        self.lock()
            .get(server_url)
            .map(|t| t.access_token.clone())
    }

    async fn authorize(&self, server_url: &str) -> AuthOutcome {
        let reloaded = load_tokens(&self.persist_path);
        let found = reloaded.contains_key(server_url);
        *self.lock() = reloaded;

        if found {
            tracing::info!(server_url, "picked up oauth token from store");
            AuthOutcome::Authorized
        } else {
            tracing::warn!(
                server_url,
                path = %self.persist_path.display(),
                "no oauth token available for server"
            );
            AuthOutcome::Denied
        }
    }

    async fn clear(&self, server_url: &str) {
        let snapshot = {
            let mut tokens = self.lock();
            if tokens.remove(server_url).is_none() {
                return;
            }
            tokens.clone()
        };
        save_tokens(&self.persist_path, snapshot);
        tracing::info!(server_url, "oauth token cleared");
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

fn load_tokens(path: &Path) -> HashMap<String, StoredToken> {
    if !path.exists() {
        return HashMap::new();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<PersistedTokens>(&content) {
            Ok(persisted) => persisted.tokens,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to parse token file, starting fresh"
                );
                HashMap::new()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read token file");
            HashMap::new()
        }
    }
}

fn save_tokens(path: &Path, tokens: HashMap<String, StoredToken>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(error = %e, "failed to create token store directory");
            return;
        }
    }

    let persisted = PersistedTokens { version: 1, tokens };
    match serde_json::to_string_pretty(&persisted) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                tracing::error!(error = %e, path = %path.display(), "failed to write token file");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_has_no_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::at_path(dir.path().join("tokens.json"));
        assert!(store.access_token("https://a.example/mcp").await.is_none());
        assert_eq!(
            store.authorize("https://a.example/mcp").await,
            AuthOutcome::Denied
        );
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        TokenStore::at_path(&path).save_token("https://a.example/mcp", "tok-1");

        let reopened = TokenStore::at_path(&path);
        assert_eq!(
            reopened.access_token("https://a.example/mcp").await.as_deref(),
            Some("tok-1")
        );
    }

    #[tokio::test]
    async fn test_authorize_picks_up_externally_written_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::at_path(&path);
        assert!(store.access_token("https://b.example/mcp").await.is_none());

        // Another process finishes the browser flow.
        TokenStore::at_path(&path).save_token("https://b.example/mcp", "fresh");

        assert_eq!(
            store.authorize("https://b.example/mcp").await,
            AuthOutcome::Authorized
        );
        assert_eq!(
            store.access_token("https://b.example/mcp").await.as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn test_clear_removes_token_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::at_path(&path);
        store.save_token("https://c.example/mcp", "tok");
        store.clear("https://c.example/mcp").await;

        let reopened = TokenStore::at_path(&path);
        assert!(reopened.access_token("https://c.example/mcp").await.is_none());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json").unwrap();
        let store = TokenStore::at_path(&path);
        assert!(store.lock().is_empty());
    }
}

//! Human-in-the-loop approvals.
//!
//! Each request is parked in a map keyed by id until the operator answers.
//! The waiting side holds a guard that removes the entry if the request is
//! abandoned, so an id is resolved at most once and never leaks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::processor::ToolCallApprover;

/// What the operator is being asked to approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    ToolCall,
    Sampling,
}

/// An outstanding decision, as announced to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub kind: ApprovalKind,
    /// Tool name, or the requesting server for sampling.
    pub tool_name: String,
    pub input: Value,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>;

/// Routes approval requests to whoever drains the announcement channel.
#[derive(Clone)]
pub struct ApprovalBroker {
    pending: PendingMap,
    announce: mpsc::UnboundedSender<PendingApproval>,
}

/// Removes the map entry when the waiting request goes away.
struct PendingGuard {
    id: String,
    pending: PendingMap,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl ApprovalBroker {
    /// Create a broker and the receiver on which new requests are announced.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingApproval>) {
        let (announce, announcements) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(Mutex::new(HashMap::new())),
                announce,
            },
            announcements,
        )
    }

    /// Park a request and wait for its answer.
    ///
    /// Resolves to `false` when nobody is listening or the entry is dropped
    /// without an answer.
    pub async fn request(
        &self,
        kind: ApprovalKind,
        tool_name: &str,
        input: &Value,
        id: Option<&str>,
    ) -> bool {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(id.clone(), tx);
            }
            Err(_) => return false,
        }
        let _guard = PendingGuard {
            id: id.clone(),
            pending: Arc::clone(&self.pending),
        };

        let announced = self.announce.send(PendingApproval {
            id: id.clone(),
            kind,
            tool_name: tool_name.to_string(),
            input: input.clone(),
        });
        if announced.is_err() {
            tracing::warn!(approval_id = %id, "no approval listener, rejecting");
            return false;
        }

        let approved = rx.await.unwrap_or(false);
        tracing::info!(approval_id = %id, tool = tool_name, approved, "approval resolved");
        approved
    }

    pub fn approve(&self, id: &str) -> bool {
        self.resolve(id, true)
    }

    pub fn reject(&self, id: &str) -> bool {
        self.resolve(id, false)
    }

    /// Resolve `id`. Returns `false` if it was not pending.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolCallApprover for ApprovalBroker {
    async fn request_tool_call_approval(&self, name: &str, input: &Value, id: &str) -> bool {
        self.request(ApprovalKind::ToolCall, name, input, Some(id))
            .await
    }
}

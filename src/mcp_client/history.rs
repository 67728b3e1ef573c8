//! Request history: a record of every request and notification a client sent.
//!
//! Entries are kept in the order requests were issued, even when their
//! responses arrive out of order.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One recorded exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHistoryEntry {
    /// The outbound message as sent.
    pub request: serde_json::Value,
    /// The result payload, if the request succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Error text, if the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Round-trip time; `None` for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Append-only history ordered by issue sequence.
#[derive(Debug, Default)]
pub struct RequestHistory {
    entries: Mutex<Vec<(u64, RequestHistoryEntry)>>,
}

impl RequestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry at the position given by its issue sequence number.
    pub fn record(&self, seq: u64, entry: RequestHistoryEntry) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pos = entries.partition_point(|(s, _)| *s <= seq);
        entries.insert(pos, (seq, entry));
    }

    /// Snapshot of all entries in issue order.
    pub fn entries(&self) -> Vec<RequestHistoryEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

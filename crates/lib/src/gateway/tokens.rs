//! Session token counters: snapshot from `sessions.list` and before/after deltas.

use serde::{Deserialize, Serialize};

/// `sessions.list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionsList {
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(alias = "key")]
    pub session_key: String,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_tokens: Option<u64>,
}

/// Token counters of one session at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSnapshot {
    pub total: u64,
    pub input: u64,
    pub output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
}

/// `after - before` per counter. Optional counters are omitted when absent on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDelta {
    pub total: i64,
    pub input: i64,
    pub output: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<i64>,
}

impl From<&SessionEntry> for TokenSnapshot {
    fn from(e: &SessionEntry) -> Self {
        Self {
            total: e.total_tokens.unwrap_or(0),
            input: e.input_tokens.unwrap_or(0),
            output: e.output_tokens.unwrap_or(0),
            cache_creation: e.cache_creation_tokens,
            cache_read: e.cache_read_tokens,
        }
    }
}

impl SessionsList {
    /// Snapshot for `session_key`; all zero when the session is not listed (yet).
    pub fn snapshot_for(&self, session_key: &str) -> TokenSnapshot {
        self.sessions
            .iter()
            .find(|s| s.session_key == session_key)
            .map(TokenSnapshot::from)
            .unwrap_or_default()
    }
}

fn diff(after: u64, before: u64) -> i64 {
    after as i64 - before as i64
}

fn diff_opt(after: Option<u64>, before: Option<u64>) -> Option<i64> {
    match (after, before) {
        (None, None) => None,
        (a, b) => Some(diff(a.unwrap_or(0), b.unwrap_or(0))),
    }
}

impl TokenSnapshot {
    pub fn delta_since(&self, before: &TokenSnapshot) -> TokenDelta {
        TokenDelta {
            total: diff(self.total, before.total),
            input: diff(self.input, before.input),
            output: diff(self.output, before.output),
            cache_creation: diff_opt(self.cache_creation, before.cache_creation),
            cache_read: diff_opt(self.cache_read, before.cache_read),
        }
    }
}

//! Gateway client errors.

/// Failure of a connect, request, or run wait. Each variant carries enough context
/// (method, run id, timeout) for a caller-side retry policy; the client never retries.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport closed or refused before the handshake reached the server's challenge.
    #[error("transport error: {0}")]
    Transport(String),
    /// Server rejected `connect`, or the connection dropped while the connect request was in flight.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// No challenge, or no connect response, within the connect timeout.
    #[error("connect handshake timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("request timeout for {method}")]
    RequestTimeout { method: String },
    /// Server answered `ok: false`.
    #[error("{method} failed: {message}")]
    RequestFailure {
        method: String,
        message: String,
        code: Option<String>,
    },
    #[error("agent wait timeout after {timeout_ms}ms")]
    RunWaitTimeout { run_id: String, timeout_ms: u64 },
    /// Lifecycle event reported `phase: error`.
    #[error("run {run_id} failed: {message}")]
    RunError { run_id: String, message: String },
    #[error("session query failed: {0}")]
    SessionQuery(String),
    /// Client disconnected (or the transport closed) while the operation was outstanding.
    #[error("disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

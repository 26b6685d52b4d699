//! Gateway WebSocket protocol types (frames, connect, chat and agent events).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name of the server's pre-connect challenge.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";
pub const CHAT_EVENT: &str = "chat";
pub const AGENT_EVENT: &str = "agent";

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            typ: "req".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Any frame the server sends. Requests from the server are not part of this protocol and fail to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape::Detail {
                message: message.into(),
                code: None,
            }),
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message().to_string())
            .unwrap_or_else(|| "request failed".to_string())
    }
}

/// Response error: either `{message, code?}` or a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorShape {
    Detail {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<Value>,
    },
    Text(String),
}

impl ErrorShape {
    pub fn message(&self) -> &str {
        match self {
            ErrorShape::Detail { message, .. } => message,
            ErrorShape::Text(s) => s,
        }
    }

    /// Error code as text; numeric codes are stringified.
    pub fn code(&self) -> Option<String> {
        match self {
            ErrorShape::Detail { code: Some(Value::String(s)), .. } => Some(s.clone()),
            ErrorShape::Detail { code: Some(Value::Null), .. } => None,
            ErrorShape::Detail { code: Some(v), .. } => Some(v.to_string()),
            _ => None,
        }
    }
}

/// Wire event: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// `connect` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: serde_json::Map<String, Value>,
    pub locale: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    pub device: ConnectDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    pub token: String,
}

/// Device identity sent with connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectDevice {
    pub id: String,
    pub public_key: String, // base64url raw Ed25519 public key
    pub signature: String,  // base64url signature of the canonical payload
    pub signed_at: u64,     // Unix ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Server hello-ok payload after successful connect. Everything is optional; servers vary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type", default)]
    pub typ: Option<String>,
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: Option<u64>,
}

/// `chat` event payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

/// Chat message content normalized at decode time. The wire sends a bare string, an object
/// whose `content` is a string, or an object whose `content` is a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawMessage")]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessage {
    Bare(String),
    Object {
        #[serde(default)]
        content: Option<RawContent>,
        #[serde(default)]
        text: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<RawMessage> for MessageContent {
    fn from(raw: RawMessage) -> Self {
        match raw {
            RawMessage::Bare(s) => MessageContent::Text(s),
            RawMessage::Object { content: Some(RawContent::Text(s)), .. } => MessageContent::Text(s),
            RawMessage::Object { content: Some(RawContent::Blocks(b)), .. } => MessageContent::Blocks(b),
            RawMessage::Object { content: None, text } => MessageContent::Text(text.unwrap_or_default()),
        }
    }
}

impl MessageContent {
    /// Concatenated text; only text blocks contribute, in order.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Other => None,
                })
                .collect(),
        }
    }
}

/// `agent` event payload: `{ stream, data }`. Lifecycle events carry `data.phase` and `data.runId`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub phase: LifecyclePhase,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Lifecycle data when this is a `lifecycle` stream event. The run id falls back to the
    /// top-level payload field when `data.runId` is absent.
    pub fn lifecycle(&self) -> Option<LifecycleEvent> {
        if self.stream != "lifecycle" {
            return None;
        }
        let mut ev: LifecycleEvent = serde_json::from_value(self.data.clone()).ok()?;
        if ev.run_id.is_none() {
            ev.run_id = self.run_id.clone();
        }
        Some(ev)
    }
}

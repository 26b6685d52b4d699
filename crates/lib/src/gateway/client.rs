//! Gateway client: one persistent WebSocket, device-signed connect, multiplexed requests
//! and events, and prompt runs tracked to completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::correlator::{next_request_id, PendingGuard};
use super::error::GatewayError;
use super::handshake::{Handshake, HandshakeStep};
use super::protocol::{EventFrame, HelloOk, InboundFrame, RequestFrame};
use super::router::FrameRouter;
use super::tokens::{SessionsList, TokenDelta, TokenSnapshot};
use super::waiter::{wait_for_completion, RunCompletion};
use crate::config::{self, Config};
use crate::device::DeviceIdentity;

const OUTBOUND_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection and session settings for one client, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub client_id: String,
    pub display_name: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: String,
    pub platform: String,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub session_key: String,
    pub agent_id: String,
    pub agent_wait_timeout: Duration,
    pub wait_buffer: Duration,
}

impl ClientOptions {
    /// Options from config, with the token resolved through the environment override.
    pub fn from_config(config: &Config) -> Self {
        Self::with_token(config, config::resolve_gateway_token(config))
    }

    fn with_token(config: &Config, token: Option<String>) -> Self {
        Self {
            url: config.gateway.url.clone(),
            token,
            client_id: config.client.id.clone(),
            display_name: config.client.display_name.clone(),
            client_mode: config.client.mode.clone(),
            role: config.client.role.clone(),
            scopes: config.client.scopes.clone(),
            locale: config.client.locale.clone(),
            platform: config.client.platform.clone(),
            min_protocol: config.gateway.min_protocol,
            max_protocol: config.gateway.max_protocol,
            connect_timeout: Duration::from_millis(config.gateway.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.gateway.request_timeout_ms),
            session_key: config.session.key.clone(),
            agent_id: config.session.agent_id.clone(),
            agent_wait_timeout: Duration::from_millis(config.runs.agent_wait_timeout_ms),
            wait_buffer: Duration::from_millis(config.runs.wait_buffer_ms),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::with_token(&Config::default(), None)
    }
}

/// Outcome of one prompt run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub run_id: String,
    pub text: String,
    pub token_delta: TokenDelta,
    pub elapsed_ms: u64,
    pub completed_via: RunCompletion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

pub struct GatewayClient {
    options: ClientOptions,
    router: Arc<FrameRouter>,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    hello: HelloOk,
}

impl GatewayClient {
    /// Open the socket and run the handshake. Fails on transport error, rejected connect, or
    /// when opening plus handshake do not finish within `connect_timeout`. Never retries.
    pub async fn connect(options: ClientOptions, identity: &DeviceIdentity) -> Result<Self, GatewayError> {
        let timeout_ms = options.connect_timeout.as_millis() as u64;
        let (hello, sink, stream) = tokio::time::timeout(
            options.connect_timeout,
            open_and_authenticate(&options, identity),
        )
        .await
        .map_err(|_| GatewayError::ConnectTimeout(timeout_ms))??;

        let hello: HelloOk = serde_json::from_value(hello).unwrap_or_default();
        log::info!(
            "connected to {} as {} (protocol {:?})",
            options.url,
            identity.device_id(),
            hello.protocol
        );

        let router = Arc::new(FrameRouter::new());
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(stream, router.clone()));

        Ok(Self {
            options,
            router,
            outbound,
            reader,
            writer,
            hello,
        })
    }

    pub fn hello(&self) -> &HelloOk {
        &self.hello
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// False once the connection is torn down (server closed, transport error, or disconnect).
    /// From then on every request and run wait fails with [`GatewayError::Disconnected`].
    pub fn is_connected(&self) -> bool {
        !self.router.is_closed() && !self.reader.is_finished()
    }

    /// Every event frame received, after run routing.
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.router.subscribe()
    }

    /// Send `method` and await its response. A timeout removes the pending entry, so a late
    /// response is dropped; the connection stays open.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError> {
        let id = next_request_id();
        let rx = self.router.pending.register(&id, method)?;
        let _guard = PendingGuard::new(&self.router.pending, id.clone());
        self.send_frame(&RequestFrame::new(id, method, params)).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Disconnected),
            Err(_) => {
                log::warn!("request timeout for {}", method);
                Err(GatewayError::RequestTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn send_frame(&self, frame: &RequestFrame) -> Result<(), GatewayError> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| GatewayError::Disconnected)
    }

    /// Send one prompt to the configured session and wait for its run to finish.
    ///
    /// Takes `&mut self`: one prompt at a time per client, since the chat accumulator is
    /// reset at the start of every prompt.
    pub async fn send_prompt(&mut self, prompt: &str) -> Result<PromptResult, GatewayError> {
        if self.router.is_closed() {
            return Err(GatewayError::Disconnected);
        }
        let started = Instant::now();
        let before = self.session_tokens().await;

        self.router.begin_stream();
        let params = json!({
            "sessionKey": self.options.session_key,
            "message": prompt,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        let res = match self.request("chat.send", params, self.options.request_timeout).await {
            Ok(res) => res,
            Err(e) => {
                self.router.finish_stream("");
                return Err(e);
            }
        };
        let Some(run_id) = res.get("runId").and_then(|v| v.as_str()).map(String::from) else {
            self.router.finish_stream("");
            return Err(GatewayError::Protocol("chat.send response missing runId".to_string()));
        };
        log::debug!("prompt started run {}", run_id);

        let completion = self.wait_for_run(&run_id, self.options.agent_wait_timeout).await;
        let transcript = self.router.finish_stream(&run_id);
        let completed_via = completion?;
        if let Some(err) = &transcript.error_message {
            log::warn!("run {} chat stream reported error: {}", run_id, err);
        }

        let after = self.session_tokens().await;
        Ok(PromptResult {
            text: transcript.response_text(),
            token_delta: after.delta_since(&before),
            elapsed_ms: started.elapsed().as_millis() as u64,
            completed_via,
            stop_reason: transcript.stop_reason,
            usage: transcript.usage,
            run_id,
        })
    }

    /// Await completion of `run_id`: lifecycle event or `agent.wait` answer, whichever is first,
    /// bounded by `timeout`. The wait request gets `timeout` plus the configured buffer.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<RunCompletion, GatewayError> {
        let params = json!({
            "runId": run_id,
            "timeoutMs": timeout.as_millis() as u64,
        });
        let explicit_wait = self.request("agent.wait", params, timeout + self.options.wait_buffer);
        wait_for_completion(&self.router.runs, run_id, timeout, explicit_wait).await
    }

    pub async fn reset_session(&self) -> Result<(), GatewayError> {
        self.request(
            "sessions.reset",
            json!({ "sessionKey": self.options.session_key }),
            self.options.request_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Token counters of the configured session. Best effort: a failed query or a session that
    /// does not exist yet both read as zero.
    pub async fn session_tokens(&self) -> TokenSnapshot {
        match self.query_session_tokens().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("{}", e);
                TokenSnapshot::default()
            }
        }
    }

    async fn query_session_tokens(&self) -> Result<TokenSnapshot, GatewayError> {
        let payload = self
            .request(
                "sessions.list",
                json!({ "agentId": self.options.agent_id }),
                self.options.request_timeout,
            )
            .await
            .map_err(|e| GatewayError::SessionQuery(e.to_string()))?;
        let list: SessionsList =
            serde_json::from_value(payload).map_err(|e| GatewayError::SessionQuery(e.to_string()))?;
        Ok(list.snapshot_for(&self.options.session_key))
    }

    /// Close the connection. Outstanding requests and run waits fail with `Disconnected`.
    pub async fn disconnect(&self) {
        self.router.close();
        let _ = self.outbound.send(Message::Close(None)).await;
        self.reader.abort();
        log::info!("disconnected from {}", self.options.url);
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn open_and_authenticate(
    options: &ClientOptions,
    identity: &DeviceIdentity,
) -> Result<(Value, WsSink, WsSource), GatewayError> {
    let (ws, _) = tokio_tungstenite::connect_async(options.url.as_str())
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();
    let mut handshake = Handshake::new(identity, options);
    handshake.transport_opened();
    let hello = drive_handshake(&mut handshake, &mut sink, &mut stream).await?;
    Ok((hello, sink, stream))
}

/// Feed frames to the handshake until it authenticates or fails.
async fn drive_handshake<Si, St>(
    handshake: &mut Handshake<'_>,
    sink: &mut Si,
    stream: &mut St,
) -> Result<Value, GatewayError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let Some(msg) = stream.next().await else {
            return Err(handshake.transport_closed("connection closed"));
        };
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("closed by server: {}", f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
                return Err(handshake.transport_closed(&reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(handshake.transport_closed(&e.to_string())),
        };
        let frame = match InboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("handshake: dropping unparseable frame: {}", e);
                continue;
            }
        };
        match handshake.on_frame(frame)? {
            HandshakeStep::Continue => {}
            HandshakeStep::Send(req) => {
                let text = serde_json::to_string(&req)?;
                if let Err(e) = sink.send(Message::Text(text)).await {
                    return Err(handshake.transport_closed(&e.to_string()));
                }
            }
            HandshakeStep::Authenticated(payload) => return Ok(payload),
        }
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Message>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            log::warn!("gateway write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop<S>(mut stream: S, router: Arc<FrameRouter>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => router.dispatch_text(&text),
            Ok(Message::Close(frame)) => {
                log::info!("gateway closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("gateway read failed: {}", e);
                break;
            }
        }
    }
    router.close();
}

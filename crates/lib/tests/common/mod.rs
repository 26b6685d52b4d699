//! Scripted mock gateway for integration tests: accepts one WebSocket connection on a free
//! port and hands it to a test-supplied handler.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use runprobe::device::{build_connect_payload, verify_signature};
use runprobe::gateway::ClientOptions;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type WsStream = WebSocketStream<TcpStream>;

/// Bind 127.0.0.1:0, accept one connection, run `handler` on it. Returns the ws:// URL.
pub async fn spawn_gateway<H, Fut>(handler: H) -> (String, tokio::task::JoinHandle<()>)
where
    H: FnOnce(WsStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
    let addr = listener.local_addr().expect("local_addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = accept_async(stream).await.expect("websocket handshake");
        handler(ws).await;
    });
    (format!("ws://{}", addr), server)
}

/// Client options pointed at `url` with short timeouts.
pub fn options(url: &str) -> ClientOptions {
    ClientOptions {
        url: url.to_string(),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        agent_wait_timeout: Duration::from_secs(5),
        wait_buffer: Duration::from_millis(500),
        ..ClientOptions::default()
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send frame");
}

/// Next text frame as JSON; None once the client closed.
pub async fn recv_json(ws: &mut WsStream) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).expect("client sent JSON")),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Read the next request and check its method. Returns (id, params).
pub async fn expect_request(ws: &mut WsStream, method: &str) -> (String, Value) {
    let frame = recv_json(ws).await.unwrap_or_else(|| panic!("connection closed before {}", method));
    assert_eq!(frame["type"], "req");
    assert_eq!(frame["method"], method, "unexpected request {}", frame);
    let id = frame["id"].as_str().expect("request id").to_string();
    (id, frame["params"].clone())
}

pub async fn respond_ok(ws: &mut WsStream, id: &str, payload: Value) {
    send_json(ws, json!({"type": "res", "id": id, "ok": true, "payload": payload})).await;
}

pub async fn respond_err(ws: &mut WsStream, id: &str, message: &str, code: &str) {
    send_json(
        ws,
        json!({"type": "res", "id": id, "ok": false, "error": {"message": message, "code": code}}),
    )
    .await;
}

pub async fn send_event(ws: &mut WsStream, event: &str, payload: Value) {
    send_json(ws, json!({"type": "event", "event": event, "payload": payload})).await;
}

pub async fn send_delta(ws: &mut WsStream, run_id: &str, seq: u64, text: &str) {
    send_event(
        ws,
        "chat",
        json!({"runId": run_id, "sessionKey": "agent:main:main", "seq": seq, "state": "delta", "message": text}),
    )
    .await;
}

pub async fn send_lifecycle(ws: &mut WsStream, run_id: &str, phase: &str, error: Option<&str>) {
    let mut data = json!({"phase": phase, "runId": run_id});
    if let Some(e) = error {
        data["error"] = json!(e);
    }
    send_event(ws, "agent", json!({"runId": run_id, "stream": "lifecycle", "data": data})).await;
}

/// Verify the device signature of a `connect` request the way the server does.
pub fn assert_connect_signed(params: &Value, nonce: &str) {
    let device = &params["device"];
    let scopes: Vec<String> = serde_json::from_value(params["scopes"].clone()).expect("scopes");
    let token = params["auth"]["token"].as_str().unwrap_or("");
    let payload = build_connect_payload(
        device["id"].as_str().expect("device.id"),
        params["client"]["id"].as_str().expect("client.id"),
        params["client"]["mode"].as_str().expect("client.mode"),
        params["role"].as_str().expect("role"),
        &scopes,
        device["signedAt"].as_u64().expect("signedAt"),
        token,
        Some(nonce),
    );
    assert!(payload.starts_with("v2|"));
    verify_signature(
        device["publicKey"].as_str().expect("publicKey"),
        &payload,
        device["signature"].as_str().expect("signature"),
    )
    .expect("device signature verifies");
}

/// Challenge with `nonce`, check the signed connect, answer hello-ok. Returns connect params.
pub async fn accept_connect(ws: &mut WsStream, nonce: &str) -> Value {
    send_event(ws, "connect.challenge", json!({"nonce": nonce, "ts": 1_700_000_000_000u64})).await;
    let (id, params) = expect_request(ws, "connect").await;
    assert_eq!(params["device"]["nonce"], nonce);
    assert_connect_signed(&params, nonce);
    respond_ok(
        ws,
        &id,
        json!({"type": "hello-ok", "protocol": 3, "policy": {"tickIntervalMs": 30000}}),
    )
    .await;
    params
}

pub fn sessions(key: &str, total: u64, input: u64, output: u64) -> Value {
    json!({"sessions": [{"key": key, "totalTokens": total, "inputTokens": input, "outputTokens": output}]})
}

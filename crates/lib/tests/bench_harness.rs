//! Integration test: one harness variant end to end against the mock gateway, with in-memory
//! flag and restart collaborators and the JSON result store.

mod common;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use runprobe::bench::{
    DirectoryCapture, FlagToggle, Harness, InstanceControl, JsonResultStore, ResultStore,
};
use runprobe::device::DeviceIdentity;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlagToggle for Recorder {
    async fn set(&self, enabled: bool) -> anyhow::Result<()> {
        self.push(format!("flag={}", enabled));
        Ok(())
    }
}

#[async_trait]
impl InstanceControl for Recorder {
    async fn restart(&self) -> anyhow::Result<()> {
        self.push("restart".to_string());
        Ok(())
    }
}

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("runprobe-bench-{}-{}", tag, uuid::Uuid::new_v4()))
}

/// reset, tokens, chat.send, agent.wait, then the scripted outcome (and tokens again on success).
async fn serve_prompt(ws: &mut WsStream, run_id: &str, reply: Result<&str, &str>, before: u64, after: u64) {
    let (id, params) = expect_request(ws, "sessions.reset").await;
    assert_eq!(params["sessionKey"], "agent:main:main");
    respond_ok(ws, &id, json!({"ok": true})).await;
    let (id, _) = expect_request(ws, "sessions.list").await;
    respond_ok(ws, &id, sessions("agent:main:main", before, before, 0)).await;
    let (id, _) = expect_request(ws, "chat.send").await;
    respond_ok(ws, &id, json!({"runId": run_id})).await;
    expect_request(ws, "agent.wait").await;
    match reply {
        Ok(text) => {
            send_delta(ws, run_id, 0, text).await;
            send_lifecycle(ws, run_id, "end", None).await;
            let (id, _) = expect_request(ws, "sessions.list").await;
            respond_ok(ws, &id, sessions("agent:main:main", after, after, 0)).await;
        }
        // A failed run ends the prompt without a second token query.
        Err(error) => send_lifecycle(ws, run_id, "error", Some(error)).await,
    }
}

#[tokio::test]
async fn run_variant_records_each_prompt() {
    let (url, server) = spawn_gateway(|mut ws| async move {
        accept_connect(&mut ws, "bench").await;
        serve_prompt(&mut ws, "run-a", Ok("first answer"), 0, 120).await;
        serve_prompt(&mut ws, "run-b", Err("tool crashed"), 0, 0).await;
        let _ = recv_json(&mut ws).await;
    })
    .await;

    let workspace = temp_dir("ws");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join("MEMORY.md"), "remembered").unwrap();
    let results = temp_dir("results");

    let recorder = Recorder::default();
    let harness = Harness::new(
        options(&url),
        DeviceIdentity::generate().unwrap(),
        vec!["first prompt".to_string(), "second prompt".to_string()],
        Box::new(recorder.clone()),
        Box::new(recorder.clone()),
        Box::new(JsonResultStore::new(results.clone())),
    )
    .with_workspace(Box::new(DirectoryCapture::new(workspace.clone())), results.join("captures"))
    .with_ready_timeout(Duration::from_secs(5));

    let records = harness.run_variant(true).await.expect("variant runs");
    assert_eq!(recorder.calls(), vec!["flag=true".to_string(), "restart".to_string()]);
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.label, "flag-on");
    assert!(first.flag_enabled);
    let result = first.result.as_ref().expect("first prompt succeeded");
    assert_eq!(result.text, "first answer");
    assert_eq!(result.token_delta.total, 120);
    assert_eq!(first.artifacts.len(), 1);
    assert!(first.artifacts[0].ends_with("MEMORY.md"));

    let second = &records[1];
    assert!(second.result.is_none());
    assert!(second.error.as_deref().unwrap_or("").contains("tool crashed"));

    let saved: Vec<Value> = std::fs::read_dir(&results)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |x| x == "json"))
        .map(|e| serde_json::from_str(&std::fs::read_to_string(e.path()).unwrap()).unwrap())
        .collect();
    assert_eq!(saved.len(), 2);
    assert!(saved.iter().any(|r| r["result"]["text"] == "first answer"));
    assert!(saved.iter().any(|r| r["error"].is_string()));

    server.await.expect("server task");
    let _ = std::fs::remove_dir_all(&workspace);
    let _ = std::fs::remove_dir_all(&results);
}

#[tokio::test]
async fn unreachable_gateway_aborts_after_ready_timeout() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let recorder = Recorder::default();
    let harness = Harness::new(
        options(&format!("ws://{}", addr)),
        DeviceIdentity::generate().unwrap(),
        vec!["never sent".to_string()],
        Box::new(recorder.clone()),
        Box::new(recorder.clone()),
        Box::new(JsonResultStore::new(temp_dir("unused"))),
    )
    .with_ready_timeout(Duration::from_millis(100));

    let err = harness.run_variant(false).await.unwrap_err();
    assert!(format!("{:#}", err).contains("gateway not ready"));
    assert_eq!(recorder.calls(), vec!["flag=false".to_string(), "restart".to_string()]);
}

#[tokio::test]
async fn result_store_trait_object_saves() {
    let dir = temp_dir("store");
    let store: Box<dyn ResultStore> = Box::new(JsonResultStore::new(dir.clone()));
    let record = runprobe::bench::ResultRecord::new("flag-on", true, 0, "p");
    let path = store.save(&record).await.unwrap();
    assert!(path.starts_with(&dir));
    let _ = std::fs::remove_dir_all(&dir);
}

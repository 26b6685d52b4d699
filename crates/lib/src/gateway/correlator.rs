//! Pending request table: request id -> continuation awaiting the matching response.
//!
//! An entry is removed exactly once, by whichever comes first: the response (`settle`), the
//! caller giving up (timeout or drop, via [`PendingGuard`]), or teardown (`close`). A late or
//! duplicate response finds no entry and is dropped. Once closed, the table refuses new entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::GatewayError;
use super::protocol::ResponseFrame;

pub type RequestResult = Result<Value, GatewayError>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<RequestResult>,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
    /// Set and read only while `inner` is locked.
    closed: AtomicBool,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fresh correlation id. Random v4 uuids, so ids are never reused while a request is pending.
pub fn next_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` before its request is transmitted, so an immediate response cannot be missed.
    /// Fails with [`GatewayError::Disconnected`] once the table is closed.
    pub fn register(&self, id: &str, method: &str) -> Result<oneshot::Receiver<RequestResult>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        let mut g = lock(&self.inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Disconnected);
        }
        if g.contains_key(id) {
            return Err(GatewayError::Protocol(format!("request id {} already pending", id)));
        }
        g.insert(
            id.to_string(),
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Settle the entry matching `res.id`. Returns false when nothing was pending under that id.
    pub fn settle(&self, res: ResponseFrame) -> bool {
        let Some(entry) = lock(&self.inner).remove(&res.id) else {
            log::debug!("dropping response for unknown request {}", res.id);
            return false;
        };
        let result = if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            Err(GatewayError::RequestFailure {
                method: entry.method.clone(),
                message: res.error_message(),
                code: res.error.as_ref().and_then(|e| e.code()),
            })
        };
        // Receiver may already be gone (caller dropped); nothing else to do.
        let _ = entry.tx.send(result);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        lock(&self.inner).remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.inner).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject every outstanding request with [`GatewayError::Disconnected`], clear the table and
    /// refuse later registrations.
    pub fn close(&self) {
        let drained: Vec<PendingRequest> = {
            let mut g = lock(&self.inner);
            self.closed.store(true, Ordering::Release);
            g.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            log::debug!("abandoning pending {} request", entry.method);
            let _ = entry.tx.send(Err(GatewayError::Disconnected));
        }
    }
}

/// Removes a pending entry when the awaiting future finishes or is dropped.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: String,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, id: impl Into<String>) -> Self {
        Self {
            pending,
            id: id.into(),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| next_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let p = PendingRequests::new();
        let _rx = p.register("a", "health").unwrap();
        assert!(p.register("a", "health").is_err());
    }

    #[tokio::test]
    async fn response_settles_exactly_once() {
        let p = PendingRequests::new();
        let rx = p.register("1", "chat.send").unwrap();
        assert!(p.settle(ResponseFrame::ok("1", json!({"runId": "r1"}))));
        assert!(!p.settle(ResponseFrame::ok("1", json!({"runId": "other"}))));
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["runId"], "r1");
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn error_response_carries_method_and_message() {
        let p = PendingRequests::new();
        let rx = p.register("2", "sessions.reset").unwrap();
        p.settle(ResponseFrame::err("2", "no such session"));
        match rx.await.unwrap() {
            Err(GatewayError::RequestFailure { method, message, .. }) => {
                assert_eq!(method, "sessions.reset");
                assert_eq!(message, "no such session");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn guard_removes_entry_so_late_response_is_ignored() {
        let p = PendingRequests::new();
        let _rx = p.register("3", "agent.wait").unwrap();
        {
            let _guard = PendingGuard::new(&p, "3");
        }
        assert!(!p.contains("3"));
        assert!(!p.settle(ResponseFrame::ok("3", json!({}))));
    }

    #[tokio::test]
    async fn close_rejects_with_disconnected() {
        let p = PendingRequests::new();
        let rx1 = p.register("a", "x").unwrap();
        let rx2 = p.register("b", "y").unwrap();
        p.close();
        assert!(matches!(rx1.await.unwrap(), Err(GatewayError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(GatewayError::Disconnected)));
        assert!(p.is_empty());
        assert!(p.is_closed());
    }

    #[test]
    fn closed_table_refuses_registration() {
        let p = PendingRequests::new();
        p.close();
        assert!(matches!(p.register("c", "sessions.reset"), Err(GatewayError::Disconnected)));
        assert!(p.is_empty());
    }
}

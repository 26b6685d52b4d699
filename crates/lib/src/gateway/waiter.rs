//! Run completion: races the pushed lifecycle event against the explicit `agent.wait` request.
//!
//! Each awaited run gets a bounded mailbox registered under its run id. The router posts
//! lifecycle events into it; the waiter selects over the mailbox, the wait request and an
//! overall deadline. The registry entry is the single source of truth for "not yet settled":
//! settling removes it, and a waiter whose entry was already removed (by teardown) reports
//! [`GatewayError::Disconnected`] instead of its own outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::correlator::lock;
use super::error::GatewayError;
use super::protocol::{LifecycleEvent, LifecyclePhase};

const MAILBOX_CAPACITY: usize = 8;

/// Which signal settled a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCompletion {
    /// Lifecycle `end` event.
    Lifecycle,
    /// `agent.wait` response.
    Wait,
}

struct RunWaitContext {
    token: u64,
    tx: mpsc::Sender<LifecycleEvent>,
}

/// Registry of runs whose completion is being awaited, keyed by run id.
#[derive(Default)]
pub struct RunWaiters {
    inner: Mutex<HashMap<String, RunWaitContext>>,
    next_token: AtomicU64,
    /// Set and read only while `inner` is locked.
    closed: AtomicBool,
}

/// Handle returned by [`RunWaiters::register`]; identifies this particular registration.
pub struct RunRegistration {
    run_id: String,
    token: u64,
    rx: mpsc::Receiver<LifecycleEvent>,
}

impl RunWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox for `run_id`. A second registration for the same run replaces the
    /// first, whose waiter then sees its mailbox close. After [`close`](Self::close) the
    /// mailbox comes back already closed.
    pub fn register(&self, run_id: &str) -> RunRegistration {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut g = lock(&self.inner);
        if self.closed.load(Ordering::Acquire) {
            log::debug!("run {} not registered: waiters closed", run_id);
        } else if g
            .insert(run_id.to_string(), RunWaitContext { token, tx })
            .is_some()
        {
            log::warn!("run {} was already being awaited; replacing waiter", run_id);
        }
        RunRegistration {
            run_id: run_id.to_string(),
            token,
            rx,
        }
    }

    /// Post a terminal lifecycle event (`end` or `error`) to the run's mailbox; other phases are
    /// only logged. Returns false when no one awaits the run.
    pub fn deliver(&self, run_id: &str, event: LifecycleEvent) -> bool {
        let g = lock(&self.inner);
        let Some(ctx) = g.get(run_id) else {
            log::debug!("dropping lifecycle {:?} for unawaited run {}", event.phase, run_id);
            return false;
        };
        if !matches!(event.phase, LifecyclePhase::End | LifecyclePhase::Error) {
            log::debug!("run {} lifecycle {:?}", run_id, event.phase);
            return true;
        }
        if let Err(e) = ctx.tx.try_send(event) {
            log::warn!("run {} mailbox rejected lifecycle event: {}", run_id, e);
            return false;
        }
        true
    }

    /// Remove the registration if it is still the current one. True means the caller settles.
    fn settle(&self, reg: &RunRegistration) -> bool {
        let mut g = lock(&self.inner);
        match g.get(&reg.run_id) {
            Some(ctx) if ctx.token == reg.token => {
                g.remove(&reg.run_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, run_id: &str) -> bool {
        lock(&self.inner).contains_key(run_id)
    }

    /// Drop every registration and refuse new ones; waiters resolve to
    /// [`GatewayError::Disconnected`].
    pub fn close(&self) {
        let mut g = lock(&self.inner);
        self.closed.store(true, Ordering::Release);
        g.clear();
    }
}

/// `status` of an `agent.wait` answer when it is present and not `ok`.
fn wait_status(payload: &Value) -> Option<&str> {
    payload
        .get("status")
        .and_then(Value::as_str)
        .filter(|s| *s != "ok")
}

/// Wait for `run_id` to complete.
///
/// Registers the run's mailbox before `explicit_wait` is first polled, then settles on the
/// first of: lifecycle `end` (success), lifecycle `error` (run error), the explicit wait
/// answering (success) or failing (its error), or `timeout` elapsing.
pub async fn wait_for_completion<F>(
    waiters: &RunWaiters,
    run_id: &str,
    timeout: Duration,
    explicit_wait: F,
) -> Result<RunCompletion, GatewayError>
where
    F: Future<Output = Result<Value, GatewayError>>,
{
    let mut reg = waiters.register(run_id);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    tokio::pin!(explicit_wait);

    let outcome = loop {
        tokio::select! {
            signal = reg.rx.recv() => match signal {
                Some(ev) => match ev.phase {
                    LifecyclePhase::End => break Ok(RunCompletion::Lifecycle),
                    LifecyclePhase::Error => {
                        break Err(GatewayError::RunError {
                            run_id: run_id.to_string(),
                            message: ev.error.unwrap_or_else(|| "run failed".to_string()),
                        })
                    }
                    LifecyclePhase::Start | LifecyclePhase::Unknown => {
                        log::debug!("run {} lifecycle {:?}", run_id, ev.phase);
                    }
                },
                None => break Err(GatewayError::Disconnected),
            },
            res = &mut explicit_wait => {
                break res.map(|payload| {
                    match wait_status(&payload) {
                        Some(status) => log::warn!(
                            "agent.wait for {} answered with status {:?}; treating the run as complete",
                            run_id,
                            status
                        ),
                        None => log::debug!("agent.wait for {} answered: {}", run_id, payload),
                    }
                    RunCompletion::Wait
                });
            }
            _ = &mut deadline => {
                break Err(GatewayError::RunWaitTimeout {
                    run_id: run_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    };

    if !waiters.settle(&reg) {
        // Teardown got here first; whatever we raced to is moot.
        return Err(GatewayError::Disconnected);
    }
    match &outcome {
        Ok(via) => log::info!("run {} completed via {:?}", run_id, via),
        Err(e) => log::warn!("run {} did not complete: {}", run_id, e),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn lifecycle(phase: LifecyclePhase, run_id: &str, error: Option<&str>) -> LifecycleEvent {
        LifecycleEvent {
            phase,
            run_id: Some(run_id.to_string()),
            error: error.map(String::from),
        }
    }

    #[tokio::test]
    async fn lifecycle_end_settles_and_later_wait_response_is_moot() {
        let waiters = Arc::new(RunWaiters::new());
        let (wait_tx, wait_rx) = oneshot::channel::<Result<Value, GatewayError>>();
        let explicit = async move { wait_rx.await.unwrap_or(Err(GatewayError::Disconnected)) };

        let w = waiters.clone();
        let task = tokio::spawn(async move {
            wait_for_completion(&w, "r1", Duration::from_secs(5), explicit).await
        });
        while !waiters.is_registered("r1") {
            tokio::task::yield_now().await;
        }
        assert!(waiters.deliver("r1", lifecycle(LifecyclePhase::Start, "r1", None)));
        assert!(waiters.deliver("r1", lifecycle(LifecyclePhase::End, "r1", None)));

        let result = task.await.unwrap();
        assert_eq!(result.unwrap(), RunCompletion::Lifecycle);
        assert!(!waiters.is_registered("r1"));
        // The explicit wait answering afterwards reaches no one.
        assert!(wait_tx.send(Ok(json!({"status": "ok"}))).is_err());
        assert!(!waiters.deliver("r1", lifecycle(LifecyclePhase::End, "r1", None)));
    }

    #[tokio::test]
    async fn lifecycle_error_rejects_with_text() {
        let waiters = Arc::new(RunWaiters::new());
        let w = waiters.clone();
        let task = tokio::spawn(async move {
            wait_for_completion(&w, "r2", Duration::from_secs(5), std::future::pending()).await
        });
        while !waiters.is_registered("r2") {
            tokio::task::yield_now().await;
        }
        waiters.deliver("r2", lifecycle(LifecyclePhase::Error, "r2", Some("model overloaded")));
        match task.await.unwrap() {
            Err(GatewayError::RunError { run_id, message }) => {
                assert_eq!(run_id, "r2");
                assert_eq!(message, "model overloaded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn explicit_wait_settles_when_no_lifecycle_arrives() {
        let waiters = RunWaiters::new();
        let result = wait_for_completion(&waiters, "r3", Duration::from_secs(5), async {
            Ok(json!({"status": "ok"}))
        })
        .await;
        assert_eq!(result.unwrap(), RunCompletion::Wait);
        assert!(!waiters.is_registered("r3"));
    }

    #[tokio::test]
    async fn explicit_wait_failure_propagates() {
        let waiters = RunWaiters::new();
        let result = wait_for_completion(&waiters, "r4", Duration::from_secs(5), async {
            Err(GatewayError::RequestTimeout {
                method: "agent.wait".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(GatewayError::RequestTimeout { .. })));
    }

    #[tokio::test]
    async fn deadline_rejects_and_late_lifecycle_is_ignored() {
        let waiters = RunWaiters::new();
        let result =
            wait_for_completion(&waiters, "r5", Duration::from_millis(30), std::future::pending()).await;
        match result {
            Err(e @ GatewayError::RunWaitTimeout { .. }) => {
                assert_eq!(e.to_string(), "agent wait timeout after 30ms");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!waiters.deliver("r5", lifecycle(LifecyclePhase::End, "r5", None)));
    }

    #[tokio::test]
    async fn close_resolves_waiter_as_disconnected() {
        let waiters = Arc::new(RunWaiters::new());
        let w = waiters.clone();
        let task = tokio::spawn(async move {
            wait_for_completion(&w, "r6", Duration::from_secs(5), std::future::pending()).await
        });
        while !waiters.is_registered("r6") {
            tokio::task::yield_now().await;
        }
        waiters.close();
        assert!(matches!(task.await.unwrap(), Err(GatewayError::Disconnected)));
    }

    #[tokio::test]
    async fn closed_waiters_settle_immediately_as_disconnected() {
        let waiters = RunWaiters::new();
        waiters.close();
        let started = std::time::Instant::now();
        let result =
            wait_for_completion(&waiters, "r7", Duration::from_secs(5), std::future::pending()).await;
        assert!(matches!(result, Err(GatewayError::Disconnected)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!waiters.is_registered("r7"));
    }

    #[tokio::test]
    async fn burst_of_non_terminal_phases_does_not_crowd_out_end() {
        let waiters = Arc::new(RunWaiters::new());
        let w = waiters.clone();
        let task = tokio::spawn(async move {
            wait_for_completion(&w, "r8", Duration::from_secs(5), std::future::pending()).await
        });
        while !waiters.is_registered("r8") {
            tokio::task::yield_now().await;
        }
        for _ in 0..(MAILBOX_CAPACITY * 4) {
            assert!(waiters.deliver("r8", lifecycle(LifecyclePhase::Start, "r8", None)));
            assert!(waiters.deliver("r8", lifecycle(LifecyclePhase::Unknown, "r8", None)));
        }
        assert!(waiters.deliver("r8", lifecycle(LifecyclePhase::End, "r8", None)));
        assert_eq!(task.await.unwrap().unwrap(), RunCompletion::Lifecycle);
    }

    #[test]
    fn wait_status_flags_only_non_ok_answers() {
        assert_eq!(wait_status(&json!({"status": "ok"})), None);
        assert_eq!(wait_status(&json!({})), None);
        assert_eq!(wait_status(&json!({"status": "timeout"})), Some("timeout"));
        assert_eq!(wait_status(&json!({"status": "error", "error": "boom"})), Some("error"));
    }
}

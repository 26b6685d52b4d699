//! Accumulates streamed `chat` deltas into per-run response text.

use std::collections::HashMap;

use serde_json::Value;

use super::protocol::{ChatEvent, ChatState};

/// Collected output of one run's chat stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTranscript {
    pub text: String,
    /// Terminal state, if one arrived.
    pub state: Option<ChatState>,
    pub error_message: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Value>,
    /// Text of the `final` message, kept as a fallback when no deltas carried text.
    final_text: Option<String>,
}

impl ChatTranscript {
    /// Accumulated delta text, or the final message text when the run streamed nothing.
    pub fn response_text(&self) -> String {
        if self.text.is_empty() {
            self.final_text.clone().unwrap_or_default()
        } else {
            self.text.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_some()
    }
}

/// Per-run buffers, active between [`begin`](Self::begin) and [`finish`](Self::finish).
/// Runs are keyed by id so deltas arriving before the `chat.send` response are not lost.
#[derive(Debug, Default)]
pub struct ChatStreamAccumulator {
    active: bool,
    runs: HashMap<String, ChatTranscript>,
}

impl ChatStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and start collecting.
    pub fn begin(&mut self) {
        self.runs.clear();
        self.active = true;
    }

    /// Stop collecting and hand back what `run_id` produced.
    pub fn finish(&mut self, run_id: &str) -> ChatTranscript {
        self.active = false;
        let transcript = self.runs.remove(run_id).unwrap_or_default();
        self.runs.clear();
        transcript
    }

    pub fn apply(&mut self, event: &ChatEvent) {
        if !self.active {
            return;
        }
        let run = self.runs.entry(event.run_id.clone()).or_default();
        if run.is_terminal() {
            log::debug!("ignoring chat {:?} after terminal state for run {}", event.state, event.run_id);
            return;
        }
        match event.state {
            ChatState::Delta => {
                if let Some(message) = &event.message {
                    run.text.push_str(&message.text());
                }
            }
            ChatState::Final | ChatState::Aborted | ChatState::Error => {
                run.state = Some(event.state);
                run.final_text = event.message.as_ref().map(|m| m.text()).filter(|t| !t.is_empty());
                run.error_message = event.error_message.clone();
                run.stop_reason = event.stop_reason.clone();
                run.usage = event.usage.clone();
            }
        }
    }

    pub fn text(&self, run_id: &str) -> Option<&str> {
        self.runs.get(run_id).map(|r| r.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(v: Value) -> ChatEvent {
        serde_json::from_value(v).unwrap()
    }

    fn delta(run_id: &str, text: &str) -> ChatEvent {
        event(json!({"runId": run_id, "state": "delta", "message": text}))
    }

    #[test]
    fn deltas_concatenate_in_order() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        for part in ["Hel", "lo, ", "world"] {
            acc.apply(&delta("r1", part));
        }
        assert_eq!(acc.text("r1"), Some("Hello, world"));
        assert_eq!(acc.finish("r1").response_text(), "Hello, world");
    }

    #[test]
    fn all_message_shapes_contribute() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        acc.apply(&delta("r1", "a"));
        acc.apply(&event(json!({"runId": "r1", "state": "delta", "message": {"content": "b"}})));
        acc.apply(&event(json!({
            "runId": "r1",
            "state": "delta",
            "message": {"content": [{"type": "image"}, {"type": "text", "text": "c"}]}
        })));
        assert_eq!(acc.text("r1"), Some("abc"));
    }

    #[test]
    fn terminal_state_stops_accumulation() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        acc.apply(&delta("r1", "x"));
        acc.apply(&event(json!({"runId": "r1", "state": "final", "stopReason": "stop", "usage": {"output": 3}})));
        acc.apply(&delta("r1", "y"));
        let t = acc.finish("r1");
        assert_eq!(t.text, "x");
        assert_eq!(t.state, Some(ChatState::Final));
        assert_eq!(t.stop_reason.as_deref(), Some("stop"));
        assert_eq!(t.usage, Some(json!({"output": 3})));
    }

    #[test]
    fn runs_are_kept_apart() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        acc.apply(&delta("r1", "mine"));
        acc.apply(&delta("r2", "theirs"));
        assert_eq!(acc.finish("r1").text, "mine");
    }

    #[test]
    fn inactive_accumulator_ignores_events() {
        let mut acc = ChatStreamAccumulator::new();
        acc.apply(&delta("r1", "early"));
        acc.begin();
        assert_eq!(acc.text("r1"), None);
        acc.finish("r1");
        acc.apply(&delta("r1", "late"));
        assert_eq!(acc.text("r1"), None);
    }

    #[test]
    fn final_message_used_when_no_deltas() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        acc.apply(&event(json!({
            "runId": "r1",
            "state": "final",
            "message": {"content": [{"type": "text", "text": "whole reply"}]}
        })));
        assert_eq!(acc.finish("r1").response_text(), "whole reply");
    }

    #[test]
    fn error_state_keeps_message() {
        let mut acc = ChatStreamAccumulator::new();
        acc.begin();
        acc.apply(&event(json!({"runId": "r1", "state": "error", "errorMessage": "rate limited"})));
        let t = acc.finish("r1");
        assert_eq!(t.state, Some(ChatState::Error));
        assert_eq!(t.error_message.as_deref(), Some("rate limited"));
    }
}

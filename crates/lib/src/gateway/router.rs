//! Inbound frame routing: responses to the pending request table, `chat` events to the
//! stream accumulator, `agent` lifecycle events to run waiters. Every event is then
//! broadcast to subscribers. Frames nobody is waiting for are dropped.

use std::sync::Mutex;

use tokio::sync::broadcast;

use super::correlator::{lock, PendingRequests};
use super::protocol::{AgentEvent, ChatEvent, EventFrame, InboundFrame, AGENT_EVENT, CHAT_EVENT};
use super::stream::{ChatStreamAccumulator, ChatTranscript};
use super::waiter::RunWaiters;

const EVENT_BUFFER: usize = 256;

/// Per-client routing state. Each client owns one; nothing is global.
pub struct FrameRouter {
    pub pending: PendingRequests,
    pub runs: RunWaiters,
    chat: Mutex<ChatStreamAccumulator>,
    events: broadcast::Sender<EventFrame>,
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRouter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            pending: PendingRequests::new(),
            runs: RunWaiters::new(),
            chat: Mutex::new(ChatStreamAccumulator::new()),
            events,
        }
    }

    /// Route a raw text frame. Unparseable frames are logged and dropped.
    pub fn dispatch_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => log::debug!("dropping unparseable frame: {}", e),
        }
    }

    pub fn dispatch(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(res) => {
                self.pending.settle(res);
            }
            InboundFrame::Event(ev) => {
                self.route_event(&ev);
                // No subscribers is the normal case.
                let _ = self.events.send(ev);
            }
        }
    }

    fn route_event(&self, ev: &EventFrame) {
        let Some(payload) = ev.payload.clone() else {
            return;
        };
        match ev.event.as_str() {
            CHAT_EVENT => match serde_json::from_value::<ChatEvent>(payload) {
                Ok(chat) => lock(&self.chat).apply(&chat),
                Err(e) => log::debug!("malformed chat event: {}", e),
            },
            AGENT_EVENT => match serde_json::from_value::<AgentEvent>(payload) {
                Ok(agent) => {
                    if let Some(lc) = agent.lifecycle() {
                        match lc.run_id.clone() {
                            Some(run_id) => {
                                self.runs.deliver(&run_id, lc);
                            }
                            None => log::debug!("lifecycle event without runId"),
                        }
                    }
                }
                Err(e) => log::debug!("malformed agent event: {}", e),
            },
            _ => {}
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.events.subscribe()
    }

    /// Reset the accumulator and start collecting chat text.
    pub fn begin_stream(&self) {
        lock(&self.chat).begin();
    }

    pub fn finish_stream(&self, run_id: &str) -> ChatTranscript {
        lock(&self.chat).finish(run_id)
    }

    /// Reject every pending request and run waiter with `Disconnected`, clear both registries,
    /// and make later registrations fail the same way.
    pub fn close(&self) {
        self.pending.close();
        self.runs.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }
}

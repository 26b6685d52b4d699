//! Gateway client: WebSocket control-plane protocol as seen from the client side.
//!
//! One connection per [`GatewayClient`]. The first exchange is the server's `connect.challenge`
//! answered by a device-signed `connect`; after that, requests (req/res) and pushed events
//! share the socket.

mod client;
mod correlator;
mod error;
mod handshake;
mod protocol;
mod router;
mod stream;
mod tokens;
mod waiter;

pub use client::{ClientOptions, GatewayClient, PromptResult};
pub use correlator::{next_request_id, PendingGuard, PendingRequests};
pub use error::GatewayError;
pub use handshake::{Handshake, HandshakeState, HandshakeStep};
pub use protocol::{
    AgentEvent, ChatEvent, ChatState, ConnectAuth, ConnectClient, ConnectDevice, ConnectParams,
    ContentBlock, ErrorShape, EventFrame, HelloOk, InboundFrame, LifecycleEvent, LifecyclePhase,
    MessageContent, RequestFrame, ResponseFrame,
};
pub use router::FrameRouter;
pub use stream::{ChatStreamAccumulator, ChatTranscript};
pub use tokens::{SessionEntry, SessionsList, TokenDelta, TokenSnapshot};
pub use waiter::{wait_for_completion, RunCompletion, RunRegistration, RunWaiters};

//! Connect handshake state machine.
//!
//! `Disconnected -> Opened -> ChallengeReceived -> HandshakeSent -> Authenticated | Failed`.
//! The machine is pure: the client feeds it frames read off the socket and sends whatever
//! request it returns.

use serde_json::Value;

use super::client::ClientOptions;
use super::correlator::next_request_id;
use super::error::GatewayError;
use super::protocol::{
    ConnectAuth, ConnectClient, ConnectDevice, ConnectParams, InboundFrame, RequestFrame,
    CONNECT_CHALLENGE_EVENT,
};
use crate::device::{build_connect_payload, DeviceIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Opened,
    ChallengeReceived { nonce: Option<String> },
    HandshakeSent { request_id: String },
    Authenticated,
    Failed,
}

/// What the driver should do after feeding a frame.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Keep reading.
    Continue,
    /// Transmit this connect request, then keep reading.
    Send(RequestFrame),
    /// Done; carries the hello-ok payload.
    Authenticated(Value),
}

pub struct Handshake<'a> {
    identity: &'a DeviceIdentity,
    options: &'a ClientOptions,
    state: HandshakeState,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<'a> Handshake<'a> {
    pub fn new(identity: &'a DeviceIdentity, options: &'a ClientOptions) -> Self {
        Self {
            identity,
            options,
            state: HandshakeState::Disconnected,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn transport_opened(&mut self) {
        if self.state == HandshakeState::Disconnected {
            log::debug!("handshake: transport opened");
            self.state = HandshakeState::Opened;
        }
    }

    pub fn on_frame(&mut self, frame: InboundFrame) -> Result<HandshakeStep, GatewayError> {
        match (&self.state, frame) {
            (HandshakeState::Opened, InboundFrame::Event(ev)) if ev.event == CONNECT_CHALLENGE_EVENT => {
                let nonce = ev
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("nonce"))
                    .and_then(|n| n.as_str())
                    .map(String::from);
                log::debug!("handshake: challenge received (nonce: {})", nonce.is_some());
                self.state = HandshakeState::ChallengeReceived { nonce: nonce.clone() };
                let req = self.connect_request(nonce.as_deref(), now_ms())?;
                self.state = HandshakeState::HandshakeSent {
                    request_id: req.id.clone(),
                };
                Ok(HandshakeStep::Send(req))
            }
            (HandshakeState::HandshakeSent { request_id }, InboundFrame::Response(res)) if res.id == *request_id => {
                if res.ok {
                    log::debug!("handshake: authenticated");
                    self.state = HandshakeState::Authenticated;
                    Ok(HandshakeStep::Authenticated(res.payload.unwrap_or(Value::Null)))
                } else {
                    self.state = HandshakeState::Failed;
                    Err(GatewayError::Handshake(res.error_message()))
                }
            }
            (HandshakeState::Authenticated | HandshakeState::Failed, _) => {
                Err(GatewayError::Protocol("handshake already finished".to_string()))
            }
            (_, other) => {
                log::debug!("handshake: ignoring frame {:?}", other);
                Ok(HandshakeStep::Continue)
            }
        }
    }

    /// The transport errored or closed. Before the challenge this is a transport error; after
    /// the connect request went out it is a failed handshake.
    pub fn transport_closed(&mut self, reason: &str) -> GatewayError {
        let err = match &self.state {
            HandshakeState::HandshakeSent { .. } => {
                GatewayError::Handshake(format!("connection closed during handshake: {}", reason))
            }
            _ => GatewayError::Transport(reason.to_string()),
        };
        self.state = HandshakeState::Failed;
        err
    }

    /// Build the signed `connect` request.
    pub fn connect_request(&self, nonce: Option<&str>, signed_at: u64) -> Result<RequestFrame, GatewayError> {
        let o = self.options;
        let token = o.token.as_deref().unwrap_or("");
        let payload = build_connect_payload(
            self.identity.device_id(),
            &o.client_id,
            &o.client_mode,
            &o.role,
            &o.scopes,
            signed_at,
            token,
            nonce,
        );
        let params = ConnectParams {
            min_protocol: o.min_protocol,
            max_protocol: o.max_protocol,
            client: ConnectClient {
                id: o.client_id.clone(),
                display_name: o.display_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: o.platform.clone(),
                mode: o.client_mode.clone(),
            },
            role: o.role.clone(),
            scopes: o.scopes.clone(),
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: serde_json::Map::new(),
            locale: o.locale.clone(),
            user_agent: format!("runprobe/{}", env!("CARGO_PKG_VERSION")),
            auth: o.token.clone().map(|token| ConnectAuth { token }),
            device: ConnectDevice {
                id: self.identity.device_id().to_string(),
                public_key: self.identity.public_key().to_string(),
                signature: self.identity.sign(&payload),
                signed_at,
                nonce: nonce.map(String::from),
            },
        };
        Ok(RequestFrame::new(next_request_id(), "connect", serde_json::to_value(params)?))
    }
}

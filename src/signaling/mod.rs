//! Signaling vocabulary and the gateway boundary.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Outbound events are a serde-tagged enum; inbound events are matched by
//! name so unknown events (and new fields) never break the connection.

pub mod relay;
pub mod websocket;

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::platform::{CandidateInit, SessionDescription};

/// Gateway-assigned participant id. Only meaningful for the current connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A reachable participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(alias = "socketId")]
    pub id: PeerId,
    #[serde(alias = "email", default)]
    pub handle: String,
}

/// Events we send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundSignal {
    RegisterIdentity {
        handle: String,
    },
    InitiateCall {
        #[serde(rename = "targetId")]
        target_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        #[serde(rename = "targetId")]
        target_id: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "targetId")]
        target_id: PeerId,
        candidate: CandidateInit,
    },
    DeclineCall {
        #[serde(rename = "targetId")]
        target_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DisconnectCall {
        #[serde(rename = "targetId")]
        target_id: PeerId,
    },
}

impl OutboundSignal {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::RegisterIdentity { .. } => "register-identity",
            OutboundSignal::InitiateCall { .. } => "initiate-call",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::IceCandidate { .. } => "ice-candidate",
            OutboundSignal::DeclineCall { .. } => "decline-call",
            OutboundSignal::DisconnectCall { .. } => "disconnect-call",
        }
    }

    /// The participant this event is addressed to (none for registration).
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            OutboundSignal::RegisterIdentity { .. } => None,
            OutboundSignal::InitiateCall { target_id, .. }
            | OutboundSignal::Answer { target_id, .. }
            | OutboundSignal::IceCandidate { target_id, .. }
            | OutboundSignal::DeclineCall { target_id, .. }
            | OutboundSignal::DisconnectCall { target_id } => Some(target_id),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode signal")
    }
}

/// Events we receive.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    /// Our own session id, sent right after connecting.
    Welcome { id: PeerId },
    /// Full roster snapshot.
    Roster(Vec<Peer>),
    Offer {
        caller_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from: Option<PeerId>,
        answer: SessionDescription,
    },
    IceCandidate {
        from: Option<PeerId>,
        candidate: CandidateInit,
    },
    Disconnect { from: Option<PeerId> },
    Declined {
        from: PeerId,
        reason: Option<String>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct WelcomePayload {
    id: PeerId,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterPayload {
    Wrapped { participants: Vec<Peer> },
    Bare(Vec<Peer>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    caller_id: PeerId,
    offer: SessionDescription,
}

#[derive(Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    from: Option<PeerId>,
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidatePayload {
    #[serde(default)]
    from: Option<PeerId>,
    candidate: CandidateInit,
}

#[derive(Deserialize, Default)]
struct DisconnectPayload {
    #[serde(default)]
    from: Option<PeerId>,
}

#[derive(Deserialize)]
struct DeclinedPayload {
    from: PeerId,
    #[serde(default)]
    reason: Option<String>,
}

impl InboundSignal {
    /// Decode one text frame. `Ok(None)` for events we don't handle.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let env: Envelope = serde_json::from_str(text).context("Malformed signaling frame")?;
        let data = env.data;
        let signal = match env.event.as_str() {
            "welcome" => {
                let p: WelcomePayload = payload(&env.event, data)?;
                InboundSignal::Welcome { id: p.id }
            }
            "roster" | "connected-users" => {
                let peers = match payload(&env.event, data)? {
                    RosterPayload::Wrapped { participants } => participants,
                    RosterPayload::Bare(peers) => peers,
                };
                InboundSignal::Roster(peers)
            }
            "offer" => {
                let p: OfferPayload = payload(&env.event, data)?;
                InboundSignal::Offer {
                    caller_id: p.caller_id,
                    offer: p.offer,
                }
            }
            "answer" => {
                let p: AnswerPayload = payload(&env.event, data)?;
                InboundSignal::Answer {
                    from: p.from,
                    answer: p.answer,
                }
            }
            "ice-candidate" => {
                let p: CandidatePayload = payload(&env.event, data)?;
                InboundSignal::IceCandidate {
                    from: p.from,
                    candidate: p.candidate,
                }
            }
            "disconnect-call" => {
                let p: DisconnectPayload = if data.is_null() {
                    DisconnectPayload::default()
                } else {
                    payload(&env.event, data)?
                };
                InboundSignal::Disconnect { from: p.from }
            }
            "call-declined" => {
                let p: DeclinedPayload = payload(&env.event, data)?;
                InboundSignal::Declined {
                    from: p.from,
                    reason: p.reason,
                }
            }
            other => {
                tracing::debug!("Ignoring signaling event {:?}", other);
                return Ok(None);
            }
        };
        Ok(Some(signal))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundSignal::Welcome { .. } => "welcome",
            InboundSignal::Roster(_) => "roster",
            InboundSignal::Offer { .. } => "offer",
            InboundSignal::Answer { .. } => "answer",
            InboundSignal::IceCandidate { .. } => "ice-candidate",
            InboundSignal::Disconnect { .. } => "disconnect-call",
            InboundSignal::Declined { .. } => "call-declined",
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data).with_context(|| format!("Malformed {} payload", event))
}

/// What a gateway reports to the call core.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// (Re)connected and registered; `self_id` is our gateway-assigned id.
    Connected { self_id: PeerId },
    /// Connection lost. The gateway keeps retrying on its own.
    Disconnected { reason: String },
    Signal(InboundSignal),
}

/// The process-wide signaling connection.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Deliver one event. Fails `SignalingUnreachable` while disconnected.
    async fn send(&self, signal: OutboundSignal) -> Result<(), CallError>;
}

//! In-memory signaling relay.
//!
//! Behaves like the signaling server: assigns ids on join, broadcasts the
//! roster when someone registers or leaves, and forwards call events to
//! their target with the sender's id attached. Used by `duocall demo` and
//! by the multi-participant tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{GatewayEvent, InboundSignal, OutboundSignal, Peer, PeerId, SignalingGateway};
use crate::error::CallError;

struct Member {
    handle: Option<String>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    members: BTreeMap<PeerId, Member>,
    /// Everything routed, for assertions in tests.
    #[cfg(test)]
    log: Vec<(PeerId, OutboundSignal)>,
}

/// A signaling server living in this process.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect a new participant. It is greeted with `Connected` right away
    /// but only shows up in the roster after `register-identity`.
    pub fn join(&self) -> (RelayEndpoint, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = PeerId::new(format!("p{}", state.next_id));
        let _ = tx.send(GatewayEvent::Connected {
            self_id: id.clone(),
        });
        state.members.insert(
            id.clone(),
            Member {
                handle: None,
                events: tx,
            },
        );
        tracing::debug!("Relay: {} joined", id);
        (
            RelayEndpoint {
                id,
                relay: self.clone(),
            },
            rx,
        )
    }

    /// Join and register `handle` in one go, as `WsGateway` does on connect.
    pub fn join_as(&self, handle: &str) -> (RelayEndpoint, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (endpoint, rx) = self.join();
        let register = OutboundSignal::RegisterIdentity {
            handle: handle.to_string(),
        };
        if let Err(e) = self.route(&endpoint.id, register) {
            tracing::warn!("Relay: registering {} failed: {}", handle, e);
        }
        (endpoint, rx)
    }

    /// Registered participants.
    #[cfg(test)]
    pub fn roster(&self) -> Vec<Peer> {
        roster_of(&self.lock())
    }

    /// Drop a participant's connection as if the network went away.
    #[cfg(test)]
    pub fn sever(&self, id: &PeerId) {
        let mut state = self.lock();
        if let Some(member) = state.members.remove(id) {
            tracing::debug!("Relay: severing {}", id);
            let _ = member.events.send(GatewayEvent::Disconnected {
                reason: "connection severed".into(),
            });
            broadcast_roster(&state);
        }
    }

    /// Everything `id` has sent so far, in order.
    #[cfg(test)]
    pub fn sent_by(&self, id: &PeerId) -> Vec<OutboundSignal> {
        self.lock()
            .log
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    fn route(&self, from: &PeerId, signal: OutboundSignal) -> Result<(), CallError> {
        let mut state = self.lock();
        if !state.members.contains_key(from) {
            return Err(CallError::SignalingUnreachable("not connected".into()));
        }
        #[cfg(test)]
        state.log.push((from.clone(), signal.clone()));

        let (target, inbound) = match signal {
            OutboundSignal::RegisterIdentity { handle } => {
                if let Some(member) = state.members.get_mut(from) {
                    member.handle = Some(handle);
                }
                broadcast_roster(&state);
                return Ok(());
            }
            OutboundSignal::InitiateCall { target_id, offer } => (
                target_id,
                InboundSignal::Offer {
                    caller_id: from.clone(),
                    offer,
                },
            ),
            OutboundSignal::Answer { target_id, answer } => (
                target_id,
                InboundSignal::Answer {
                    from: Some(from.clone()),
                    answer,
                },
            ),
            OutboundSignal::IceCandidate {
                target_id,
                candidate,
            } => (
                target_id,
                InboundSignal::IceCandidate {
                    from: Some(from.clone()),
                    candidate,
                },
            ),
            OutboundSignal::DeclineCall { target_id, reason } => (
                target_id,
                InboundSignal::Declined {
                    from: from.clone(),
                    reason,
                },
            ),
            OutboundSignal::DisconnectCall { target_id } => (
                target_id,
                InboundSignal::Disconnect {
                    from: Some(from.clone()),
                },
            ),
        };

        match state.members.get(&target) {
            Some(member) => {
                tracing::debug!("Relay: {} -> {}: {}", from, target, inbound.name());
                let _ = member.events.send(GatewayEvent::Signal(inbound));
            }
            None => tracing::debug!("Relay: dropping {} for unknown {}", inbound.name(), target),
        }
        Ok(())
    }

    fn leave(&self, id: &PeerId) {
        let mut state = self.lock();
        if state.members.remove(id).is_some() {
            tracing::debug!("Relay: {} left", id);
            broadcast_roster(&state);
        }
    }
}

fn roster_of(state: &RelayState) -> Vec<Peer> {
    state
        .members
        .iter()
        .filter_map(|(id, m)| {
            m.handle.as_ref().map(|h| Peer {
                id: id.clone(),
                handle: h.clone(),
            })
        })
        .collect()
}

fn broadcast_roster(state: &RelayState) {
    let roster = roster_of(state);
    for member in state.members.values().filter(|m| m.handle.is_some()) {
        let _ = member
            .events
            .send(GatewayEvent::Signal(InboundSignal::Roster(roster.clone())));
    }
}

/// One participant's connection to a `MemoryRelay`. Dropping it leaves.
pub struct RelayEndpoint {
    id: PeerId,
    relay: MemoryRelay,
}

impl RelayEndpoint {
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.relay.leave(&self.id);
    }
}

#[async_trait]
impl SignalingGateway for RelayEndpoint {
    async fn send(&self, signal: OutboundSignal) -> Result<(), CallError> {
        self.relay.route(&self.id, signal)
    }
}

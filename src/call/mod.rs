//! Call session orchestration.
//!
//! `machine` owns the single call session and serializes every command,
//! signaling event and transport event through one queue. The other
//! submodules are the pieces it drives: the capture `devices`, the
//! `ice_buffer`, one `peer_session` adapter per call and the roster
//! `directory`.

pub mod devices;
pub mod directory;
pub mod ice_buffer;
pub mod machine;
pub mod peer_session;

#[cfg(test)]
mod tests;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use devices::{DeviceManager, MediaTrackSet};
pub use directory::PeerDirectory;
pub use ice_buffer::IceCandidateBuffer;
pub use machine::{spawn, CallHandle};
pub use peer_session::{PeerSessionAdapter, SessionSignal};

pub use crate::signaling::{Peer, PeerId};

use crate::error::CallError;
use crate::platform::{ConnectivityState, RemoteTrack, TransportConfig};

/// Which side started the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Session lifecycle. `Idle` and `Ended` are the same resting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Caller: acquiring capture and creating the offer.
    Calling,
    /// Caller: offer sent.
    AwaitingAnswer,
    /// Callee: offer received, waiting for the user.
    Ringing,
    /// Descriptions are being applied/created.
    Negotiating,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::AwaitingAnswer => "awaiting answer",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    Declined,
    Busy,
    NoAnswer,
    PeerLeft,
    ConnectivityLost,
    NegotiationRejected,
    SignalingUnreachable,
    DeviceError,
    /// Our outgoing attempt lost a simultaneous-call tie-break.
    GlareYielded,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangUp => "hung up",
            EndReason::RemoteHangUp => "remote hung up",
            EndReason::Declined => "declined",
            EndReason::Busy => "busy",
            EndReason::NoAnswer => "no answer",
            EndReason::PeerLeft => "peer left",
            EndReason::ConnectivityLost => "connectivity lost",
            EndReason::NegotiationRejected => "negotiation rejected",
            EndReason::SignalingUnreachable => "signaling unreachable",
            EndReason::DeviceError => "device error",
            EndReason::GlareYielded => "superseded by incoming call",
        }
    }

    /// Reason for a failed asynchronous step.
    pub fn for_error(e: &CallError) -> Self {
        match e {
            CallError::NegotiationRejected(_) => EndReason::NegotiationRejected,
            CallError::SignalingUnreachable(_) => EndReason::SignalingUnreachable,
            CallError::ConnectivityLost => EndReason::ConnectivityLost,
            CallError::Busy => EndReason::Busy,
            _ => EndReason::DeviceError,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: CallState,
    pub role: Option<Role>,
    pub remote: Option<Peer>,
    /// Set once the session becomes Active.
    pub connected_at: Option<DateTime<Utc>>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub connectivity: Option<ConnectivityState>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            role: None,
            remote: None,
            connected_at: None,
            video_enabled: true,
            audio_enabled: true,
            connectivity: None,
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Signaling connected; we are `self_id`.
    Registered { self_id: PeerId },
    RosterChanged(Vec<Peer>),
    IncomingCall(Peer),
    StateChanged(CallState),
    RemoteTrack(RemoteTrack),
    Connectivity(ConnectivityState),
    LocalMedia {
        video_enabled: bool,
        audio_enabled: bool,
    },
    /// Local preview now shows this camera (`None`: preview stopped).
    PreviewChanged { device_id: Option<String> },
    CallEnded { peer: Peer, reason: EndReason },
    CallFailed(CallError),
    /// Persistent banner until `SignalingRestored`.
    SignalingLost { reason: String },
    SignalingRestored,
}

/// Knobs for the call core.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub transport: TransportConfig,
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            ring_timeout: Duration::from_secs(45),
        }
    }
}

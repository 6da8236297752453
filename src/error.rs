//! Error taxonomy for the call core.
//!
//! `CallError` is what commands return and what the presentation layer sees.
//! `MediaError` is what capture providers report; the device manager maps it
//! into `CallError` at its boundary.

use thiserror::Error;

/// Errors surfaced by call commands and session teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Capture permission was never granted (or was refused). Retry after granting.
    #[error("capture permission denied")]
    PermissionDenied,

    /// No device matched the request or the hardware is busy.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Live device switch failed; the previous device stays active.
    #[error("device switch failed: {0}")]
    SwitchFailed(String),

    /// The signaling gateway is disconnected.
    #[error("signaling unreachable: {0}")]
    SignalingUnreachable(String),

    /// A session description was malformed or incompatible.
    #[error("negotiation rejected: {0}")]
    NegotiationRejected(String),

    /// The peer transport failed after connecting.
    #[error("connectivity lost")]
    ConnectivityLost,

    /// Another session is already in progress.
    #[error("busy: another call is in progress")]
    Busy,

    /// The target is not in the roster.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The command does not apply in the current state.
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },

    /// The call task has stopped.
    #[error("call service has shut down")]
    Shutdown,
}

/// Errors reported by a capture provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("no such device: {0}")]
    NotFound(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("platform error: {0}")]
    Platform(String),
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied => CallError::PermissionDenied,
            other => CallError::DeviceUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_mapping() {
        assert_eq!(
            CallError::from(MediaError::PermissionDenied),
            CallError::PermissionDenied
        );
        assert_eq!(
            CallError::from(MediaError::Busy("cam0".into())),
            CallError::DeviceUnavailable("device busy: cam0".into())
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let e = CallError::InvalidState {
            op: "accept",
            state: "idle".into(),
        };
        assert_eq!(e.to_string(), "cannot accept while idle");
    }
}

//! Text rendering of call events and state.

use chrono::Utc;

use crate::call::{CallState, Peer, Role, SessionSnapshot, UiEvent};
use crate::platform::Device;

pub fn event_line(event: &UiEvent) -> String {
    match event {
        UiEvent::Registered { self_id } => format!("* connected as {}", self_id),
        UiEvent::RosterChanged(peers) if peers.is_empty() => "* nobody else is online".into(),
        UiEvent::RosterChanged(peers) => format!("* {} online (type 'list')", peers.len()),
        UiEvent::IncomingCall(peer) => format!(
            "* incoming call from {} -- 'accept' or 'decline'",
            peer_label(peer)
        ),
        UiEvent::StateChanged(state) => format!("* call: {}", state),
        UiEvent::RemoteTrack(track) => format!("* receiving {} from peer", track.kind.as_str()),
        UiEvent::Connectivity(state) => format!("* media path: {}", state.as_str()),
        UiEvent::LocalMedia {
            video_enabled,
            audio_enabled,
        } => format!(
            "* camera {}, microphone {}",
            on_off(*video_enabled),
            on_off(*audio_enabled)
        ),
        UiEvent::PreviewChanged {
            device_id: Some(id),
        } => format!("* preview: {}", id),
        UiEvent::PreviewChanged { device_id: None } => "* preview stopped".into(),
        UiEvent::CallEnded { peer, reason } => {
            format!("* call with {} ended ({})", peer_label(peer), reason)
        }
        UiEvent::CallFailed(e) => format!("! call failed: {}", e),
        UiEvent::SignalingLost { reason } => {
            format!("! signaling lost: {} -- reconnecting", reason)
        }
        UiEvent::SignalingRestored => "* signaling restored".into(),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

pub fn peer_label(peer: &Peer) -> String {
    if peer.handle.is_empty() || peer.handle == peer.id.as_str() {
        peer.id.to_string()
    } else {
        format!("{} [{}]", peer.handle, peer.id)
    }
}

/// Numbered roster, as `call <n>` expects.
pub fn roster(peers: &[Peer]) -> String {
    if peers.is_empty() {
        return "(nobody online)".into();
    }
    peers
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{:>3}. {}", i + 1, peer_label(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Numbered device list, marking the active one.
pub fn devices(devices: &[Device], active: Option<&str>) -> String {
    if devices.is_empty() {
        return "(no devices)".into();
    }
    devices
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let mark = if Some(d.id.as_str()) == active { "*" } else { " " };
            let label = if d.label.is_empty() { "(unnamed)" } else { d.label.as_str() };
            format!("{}{:>2}. {} ({})", mark, i + 1, label, d.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn status(snap: &SessionSnapshot) -> String {
    let mut out = match (&snap.remote, snap.role) {
        (Some(peer), Some(role)) => {
            let dir = match role {
                Role::Caller => "to",
                Role::Callee => "from",
            };
            format!("{} call {} {}", snap.state, dir, peer_label(peer))
        }
        _ => snap.state.to_string(),
    };
    if snap.state == CallState::Active {
        if let Some(at) = snap.connected_at {
            let secs = (Utc::now() - at).num_seconds().max(0);
            out.push_str(&format!(", {:02}:{:02}", secs / 60, secs % 60));
        }
    }
    if let Some(c) = snap.connectivity {
        out.push_str(&format!(", media {}", c.as_str()));
    }
    out.push_str(&format!(
        "\ncamera {}, microphone {}",
        on_off(snap.video_enabled),
        on_off(snap.audio_enabled)
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::EndReason;
    use crate::platform::DeviceKind;

    fn bob() -> Peer {
        Peer {
            id: "p2".into(),
            handle: "bob".into(),
        }
    }

    #[test]
    fn test_event_lines() {
        assert_eq!(
            event_line(&UiEvent::IncomingCall(bob())),
            "* incoming call from bob [p2] -- 'accept' or 'decline'"
        );
        assert_eq!(
            event_line(&UiEvent::CallEnded {
                peer: bob(),
                reason: EndReason::NoAnswer
            }),
            "* call with bob [p2] ended (no answer)"
        );
        assert_eq!(
            event_line(&UiEvent::StateChanged(CallState::AwaitingAnswer)),
            "* call: awaiting answer"
        );
    }

    #[test]
    fn test_roster_numbering() {
        let anon = Peer {
            id: "p3".into(),
            handle: String::new(),
        };
        assert_eq!(roster(&[bob(), anon]), "  1. bob [p2]\n  2. p3");
        assert_eq!(roster(&[]), "(nobody online)");
    }

    #[test]
    fn test_device_list_marks_active() {
        let list = vec![
            Device {
                id: "cam-a".into(),
                kind: DeviceKind::Camera,
                label: "Front".into(),
            },
            Device {
                id: "cam-b".into(),
                kind: DeviceKind::Camera,
                label: String::new(),
            },
        ];
        assert_eq!(
            devices(&list, Some("cam-b")),
            "  1. Front (cam-a)\n* 2. (unnamed) (cam-b)"
        );
    }

    #[test]
    fn test_status_idle() {
        assert_eq!(
            status(&SessionSnapshot::default()),
            "idle\ncamera on, microphone on"
        );
    }
}

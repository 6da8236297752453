//! Multi-participant scenarios over the in-memory relay and the synthetic
//! provider.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::error::CallError;
use crate::platform::ice::{host_candidate, IceCredentials};
use crate::platform::sdp::{build_description, DescriptionParams, MediaSection};
use crate::platform::synthetic::{Permission, SyntheticPlatform, SyntheticTransportFactory};
use crate::platform::{CandidateInit, ConnectivityState, SdpKind, SessionDescription, TrackKind};
use crate::signaling::relay::{MemoryRelay, RelayEndpoint};
use crate::signaling::{OutboundSignal, SignalingGateway};

const WAIT: Duration = Duration::from_secs(5);

struct Party {
    id: PeerId,
    handle: CallHandle,
    events: mpsc::UnboundedReceiver<UiEvent>,
    platform: Arc<SyntheticPlatform>,
    factory: Arc<SyntheticTransportFactory>,
    devices: Arc<DeviceManager>,
}

fn party(relay: &MemoryRelay, name: &str) -> Party {
    party_with(relay, name, CallConfig::default())
}

fn party_with(relay: &MemoryRelay, name: &str, config: CallConfig) -> Party {
    let platform = Arc::new(SyntheticPlatform::default());
    let factory = Arc::new(SyntheticTransportFactory::new());
    let devices = Arc::new(DeviceManager::new(platform.clone(), None, false));
    let (endpoint, gateway_events) = relay.join_as(name);
    let id = endpoint.id().clone();
    let (handle, events) = spawn(
        config,
        devices.clone(),
        factory.clone(),
        Arc::new(endpoint),
        gateway_events,
    );
    Party {
        id,
        handle,
        events,
        platform,
        factory,
        devices,
    }
}

async fn sees(p: &Party, id: &PeerId) {
    for _ in 0..200 {
        if p.handle.roster().await.unwrap().iter().any(|peer| &peer.id == id) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared in the roster", id);
}

async fn reach(p: &Party, state: CallState) -> SessionSnapshot {
    timeout(WAIT, p.handle.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .unwrap()
}

async fn next_event(p: &mut Party, pred: impl Fn(&UiEvent) -> bool) -> UiEvent {
    timeout(WAIT, async {
        loop {
            let event = p.events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn ended(p: &mut Party) -> EndReason {
    match next_event(p, |e| matches!(e, UiEvent::CallEnded { .. })).await {
        UiEvent::CallEnded { reason, .. } => reason,
        _ => unreachable!(),
    }
}

/// Alice calls Bob and Bob picks up.
async fn connected_pair(relay: &MemoryRelay) -> (Party, Party) {
    let alice = party(relay, "alice");
    let bob = party(relay, "bob");
    sees(&alice, &bob.id).await;
    assert_ok!(alice.handle.call(bob.id.clone()).await);
    reach(&bob, CallState::Ringing).await;
    assert_ok!(bob.handle.accept().await);
    reach(&alice, CallState::Active).await;
    reach(&bob, CallState::Active).await;
    (alice, bob)
}

#[tokio::test]
async fn test_call_and_accept() {
    let relay = MemoryRelay::new();
    let alice = party(&relay, "alice");
    let mut bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    let incoming = next_event(&mut bob, |e| matches!(e, UiEvent::IncomingCall(_))).await;
    assert_eq!(
        incoming,
        UiEvent::IncomingCall(Peer {
            id: alice.id.clone(),
            handle: "alice".into()
        })
    );
    let ringing = reach(&bob, CallState::Ringing).await;
    assert_eq!(ringing.role, Some(Role::Callee));
    assert_eq!(alice.handle.snapshot().role, Some(Role::Caller));

    assert_ok!(bob.handle.accept().await);
    let a = reach(&alice, CallState::Active).await;
    let b = reach(&bob, CallState::Active).await;
    assert!(a.connected_at.is_some());
    assert!(b.connected_at.is_some());
    assert_eq!(a.remote.map(|p| p.id), Some(bob.id.clone()));

    for p in [&alice, &bob] {
        let connected = timeout(
            WAIT,
            p.handle
                .wait_for(|s| s.connectivity == Some(ConnectivityState::Connected)),
        )
        .await;
        assert_ok!(assert_ok!(connected));
        assert_eq!(p.factory.transports().len(), 1);
    }
    next_event(&mut bob, |e| matches!(e, UiEvent::RemoteTrack(_))).await;
}

/// A hand-written audio+video description, without embedded candidates.
fn description(kind: SdpKind, stream_id: &str) -> SessionDescription {
    let creds = IceCredentials::generate();
    let sections = [
        MediaSection {
            kind: TrackKind::Audio,
            mid: "0".into(),
            track_id: Some(format!("{}-audio", stream_id)),
            source: None,
        },
        MediaSection {
            kind: TrackKind::Video,
            mid: "1".into(),
            track_id: Some(format!("{}-video", stream_id)),
            source: None,
        },
    ];
    let sdp = build_description(&DescriptionParams {
        session_id: 7,
        version: 1,
        local_ip: "127.0.0.1",
        creds: &creds,
        stream_id,
        sections: &sections,
    });
    SessionDescription { kind, sdp }
}

/// Trickle one host candidate per port from `from` to `target`.
async fn trickle(from: &RelayEndpoint, target: &PeerId, ports: &[u16]) {
    for &port in ports {
        let candidate = host_candidate(SocketAddr::from(([127, 0, 0, 1], port)), 1);
        from.send(OutboundSignal::IceCandidate {
            target_id: target.clone(),
            candidate: CandidateInit {
                candidate: candidate.to_sdp_line(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_early_candidates_applied_in_order() {
    let relay = MemoryRelay::new();
    let bob = party(&relay, "bob");
    let (caller, _caller_rx) = relay.join_as("carol");
    sees(&bob, caller.id()).await;

    caller
        .send(OutboundSignal::InitiateCall {
            target_id: bob.id.clone(),
            offer: description(SdpKind::Offer, "carol"),
        })
        .await
        .unwrap();
    let ports = [50001u16, 50003, 50002];
    trickle(&caller, &bob.id, &ports).await;

    reach(&bob, CallState::Ringing).await;
    assert!(bob.factory.transports().is_empty());
    assert_ok!(bob.handle.accept().await);
    reach(&bob, CallState::Active).await;

    let transport = bob.factory.last().unwrap();
    let applied: Vec<u16> = transport.remote_candidates().iter().map(|c| c.port).collect();
    assert_eq!(applied, ports);
    assert!(relay
        .sent_by(&bob.id)
        .iter()
        .any(|s| matches!(s, OutboundSignal::Answer { target_id, .. } if target_id == caller.id())));
}

#[tokio::test]
async fn test_candidates_before_answer_applied_in_order() {
    let relay = MemoryRelay::new();
    let alice = party(&relay, "alice");
    let (callee, _callee_rx) = relay.join_as("dave");
    sees(&alice, callee.id()).await;

    assert_ok!(alice.handle.call(callee.id().clone()).await);
    reach(&alice, CallState::AwaitingAnswer).await;

    let ports = [50011u16, 50013, 50012];
    trickle(&callee, &alice.id, &ports).await;
    callee
        .send(OutboundSignal::Answer {
            target_id: alice.id.clone(),
            answer: description(SdpKind::Answer, "dave"),
        })
        .await
        .unwrap();
    reach(&alice, CallState::Active).await;

    let transport = alice.factory.last().unwrap();
    let applied: Vec<u16> = transport.remote_candidates().iter().map(|c| c.port).collect();
    assert_eq!(applied, ports);
    assert_eq!(alice.factory.transports().len(), 1);
}

#[tokio::test]
async fn test_hang_up_is_idempotent() {
    let relay = MemoryRelay::new();
    let (alice, mut bob) = connected_pair(&relay).await;

    assert_ok!(alice.handle.hang_up().await);
    assert_ok!(alice.handle.hang_up().await);
    assert_eq!(alice.handle.snapshot().state, CallState::Idle);
    assert!(alice.factory.last().unwrap().is_closed());
    assert!(alice.devices.current().await.is_none());

    assert_eq!(ended(&mut bob).await, EndReason::RemoteHangUp);
    assert!(bob.handle.snapshot().state.is_idle());
    let disconnects = relay
        .sent_by(&alice.id)
        .into_iter()
        .filter(|s| matches!(s, OutboundSignal::DisconnectCall { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_switch_camera_mid_call() {
    let relay = MemoryRelay::new();
    let (mut alice, _bob) = connected_pair(&relay).await;
    assert_eq!(
        assert_ok!(alice.handle.outbound_device(TrackKind::Video).await).as_deref(),
        Some("cam-front-camera")
    );

    assert_ok!(alice.handle.switch_camera("cam-back-camera").await);
    assert_eq!(alice.handle.snapshot().state, CallState::Active);
    assert_eq!(
        assert_ok!(alice.handle.outbound_device(TrackKind::Video).await).as_deref(),
        Some("cam-back-camera")
    );
    let preview = next_event(&mut alice, |e| matches!(e, UiEvent::PreviewChanged { .. })).await;
    assert_eq!(
        preview,
        UiEvent::PreviewChanged {
            device_id: Some("cam-back-camera".into())
        }
    );
    // No renegotiation.
    assert_eq!(alice.factory.transports().len(), 1);
}

#[tokio::test]
async fn test_failed_switch_keeps_current_camera() {
    let relay = MemoryRelay::new();
    let (alice, _bob) = connected_pair(&relay).await;
    alice.platform.set_busy("cam-back-camera", true);

    let err = assert_err!(alice.handle.switch_camera("cam-back-camera").await);
    assert!(matches!(err, CallError::SwitchFailed(_)));
    assert_eq!(alice.handle.snapshot().state, CallState::Active);
    assert_eq!(
        assert_ok!(alice.handle.outbound_device(TrackKind::Video).await).as_deref(),
        Some("cam-front-camera")
    );
    let current = alice.devices.current().await.unwrap();
    assert!(current.video.is_live());
}

#[tokio::test]
async fn test_glare_leaves_one_caller() {
    let relay = MemoryRelay::new();
    let alice = party(&relay, "alice");
    let bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;
    sees(&bob, &alice.id).await;

    let (a, b) = tokio::join!(
        alice.handle.call(bob.id.clone()),
        bob.handle.call(alice.id.clone())
    );
    assert_ok!(a);
    assert_ok!(b);

    let a = reach(&alice, CallState::Active).await;
    let b = reach(&bob, CallState::Active).await;
    // The lower id keeps the caller role.
    assert_eq!(a.role, Some(Role::Caller));
    assert_eq!(b.role, Some(Role::Callee));
    assert_eq!(alice.factory.transports().len(), 1);

    let answered_by = |id: &PeerId| {
        relay
            .sent_by(id)
            .iter()
            .filter(|s| matches!(s, OutboundSignal::Answer { .. }))
            .count()
    };
    assert_eq!(answered_by(&alice.id), 0);
    assert_eq!(answered_by(&bob.id), 1);
}

#[tokio::test]
async fn test_second_caller_gets_busy() {
    let relay = MemoryRelay::new();
    let (alice, _bob) = connected_pair(&relay).await;
    let mut carol = party(&relay, "carol");
    sees(&carol, &alice.id).await;

    assert_ok!(carol.handle.call(alice.id.clone()).await);
    assert_eq!(ended(&mut carol).await, EndReason::Busy);
    assert_eq!(alice.handle.snapshot().state, CallState::Active);

    sees(&alice, &carol.id).await;
    assert_eq!(
        alice.handle.call(carol.id.clone()).await,
        Err(CallError::Busy)
    );
}

#[tokio::test]
async fn test_caller_hang_up_stops_ringing() {
    let relay = MemoryRelay::new();
    let alice = party(&relay, "alice");
    let mut bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    reach(&bob, CallState::Ringing).await;
    assert_ok!(alice.handle.hang_up().await);

    assert_eq!(ended(&mut bob).await, EndReason::RemoteHangUp);
    assert_eq!(bob.handle.snapshot().state, CallState::Idle);
    assert!(bob.factory.transports().is_empty());
    assert_err!(bob.handle.accept().await);
}

#[tokio::test]
async fn test_decline() {
    let relay = MemoryRelay::new();
    let mut alice = party(&relay, "alice");
    let bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    reach(&bob, CallState::Ringing).await;
    assert_ok!(bob.handle.decline().await);
    assert_eq!(ended(&mut alice).await, EndReason::Declined);
    assert!(alice.devices.current().await.is_none());
}

#[tokio::test]
async fn test_hang_up_during_slow_capture() {
    let relay = MemoryRelay::new();
    let alice = party(&relay, "alice");
    let bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;
    alice.platform.set_acquire_delay(Duration::from_millis(200));

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    assert_eq!(alice.handle.snapshot().state, CallState::Calling);
    assert_ok!(alice.handle.hang_up().await);
    sleep(Duration::from_millis(400)).await;

    assert_eq!(alice.handle.snapshot().state, CallState::Idle);
    assert!(alice.factory.transports().is_empty());
    assert!(alice.devices.current().await.is_none());
    assert!(!relay
        .sent_by(&alice.id)
        .iter()
        .any(|s| matches!(s, OutboundSignal::InitiateCall { .. })));
    assert_eq!(bob.handle.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn test_transport_failure_ends_call() {
    let relay = MemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay).await;

    alice
        .factory
        .last()
        .unwrap()
        .simulate(ConnectivityState::Failed);
    let failed = next_event(&mut alice, |e| matches!(e, UiEvent::CallFailed(_))).await;
    assert_eq!(failed, UiEvent::CallFailed(CallError::ConnectivityLost));
    assert_eq!(ended(&mut alice).await, EndReason::ConnectivityLost);
    assert_eq!(ended(&mut bob).await, EndReason::RemoteHangUp);
}

#[tokio::test]
async fn test_signaling_loss_ends_call() {
    let relay = MemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay).await;

    relay.sever(&alice.id);
    next_event(&mut alice, |e| matches!(e, UiEvent::SignalingLost { .. })).await;
    assert_eq!(alice.handle.snapshot().state, CallState::Idle);
    assert!(assert_ok!(alice.handle.roster().await).is_empty());
    assert!(matches!(
        alice.handle.call(bob.id.clone()).await,
        Err(CallError::SignalingUnreachable(_))
    ));

    assert_eq!(ended(&mut bob).await, EndReason::PeerLeft);
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let relay = MemoryRelay::new();
    let config = CallConfig {
        ring_timeout: Duration::from_millis(100),
        ..CallConfig::default()
    };
    let mut alice = party_with(&relay, "alice", config);
    let mut bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    assert_eq!(ended(&mut alice).await, EndReason::NoAnswer);
    assert_eq!(ended(&mut bob).await, EndReason::RemoteHangUp);
}

#[tokio::test]
async fn test_command_preconditions() {
    let relay = MemoryRelay::new();
    let mut alice = party(&relay, "alice");
    next_event(&mut alice, |e| matches!(e, UiEvent::Registered { .. })).await;
    assert!(matches!(
        alice.handle.accept().await,
        Err(CallError::InvalidState { op: "accept", .. })
    ));
    assert!(matches!(
        alice.handle.decline().await,
        Err(CallError::InvalidState { .. })
    ));
    assert_ok!(alice.handle.hang_up().await);
    assert!(matches!(
        alice.handle.call("nobody").await,
        Err(CallError::UnknownPeer(_))
    ));
}

#[tokio::test]
async fn test_permission_denied_fails_call() {
    let relay = MemoryRelay::new();
    let mut alice = party(&relay, "alice");
    let bob = party(&relay, "bob");
    sees(&alice, &bob.id).await;
    alice.platform.set_permission(Permission::Denied);

    assert_ok!(alice.handle.call(bob.id.clone()).await);
    let failed = next_event(&mut alice, |e| matches!(e, UiEvent::CallFailed(_))).await;
    assert_eq!(failed, UiEvent::CallFailed(CallError::PermissionDenied));
    assert_eq!(ended(&mut alice).await, EndReason::DeviceError);
    assert_eq!(bob.handle.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn test_media_toggles_and_search() {
    let relay = MemoryRelay::new();
    let (alice, _bob) = connected_pair(&relay).await;

    assert!(!assert_ok!(alice.handle.set_video_enabled(false).await));
    let snap = alice.handle.snapshot();
    assert!(!snap.video_enabled);
    assert!(snap.audio_enabled);
    assert!(!alice.devices.current().await.unwrap().video.is_enabled());

    let found = assert_ok!(alice.handle.search("BO").await);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].handle, "bob");
    assert_eq!(assert_ok!(alice.handle.list_cameras().await).len(), 2);
}

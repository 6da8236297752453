//! The call session state machine.
//!
//! A single task owns all session state. Commands from `CallHandle`s,
//! gateway events, transport events and the results of long-running steps
//! are all handled one at a time by that task, so every transition is
//! atomic. Steps that wait on hardware or on the transport (capture,
//! offer/answer creation) run as separate tasks and report back stamped
//! with the session generation; a result whose generation is no longer
//! current is discarded and its transport disposed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{
    CallConfig, CallState, DeviceManager, EndReason, IceCandidateBuffer, Peer, PeerDirectory,
    PeerId, PeerSessionAdapter, Role, SessionSignal, SessionSnapshot, UiEvent,
};
use crate::error::CallError;
use crate::platform::{
    CandidateInit, ConnectivityState, Device, SessionDescription, TrackKind, TransportConfig,
    TransportFactory,
};
use crate::signaling::{GatewayEvent, InboundSignal, OutboundSignal, SignalingGateway};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Call { peer: PeerId, reply: Reply<()> },
    Accept { reply: Reply<()> },
    Decline { reply: Reply<()> },
    HangUp { reply: Reply<()> },
    SwitchCamera { device_id: String, reply: Reply<()> },
    SetVideo { enabled: bool, reply: oneshot::Sender<bool> },
    SetAudio { enabled: bool, reply: oneshot::Sender<bool> },
    ListCameras { reply: Reply<Vec<Device>> },
    ListMicrophones { reply: Reply<Vec<Device>> },
    RefreshDevices { reply: Reply<Vec<Device>> },
    StartPreview { reply: Reply<()> },
    StopPreview { reply: oneshot::Sender<()> },
    Roster { reply: oneshot::Sender<Vec<Peer>> },
    Search { term: String, reply: oneshot::Sender<Vec<Peer>> },
    OutboundDevice { kind: TrackKind, reply: oneshot::Sender<Option<String>> },
}

enum Internal {
    Gateway(GatewayEvent),
    GatewayClosed,
    Session { generation: u64, signal: SessionSignal },
    Step { generation: u64, outcome: StepOutcome },
    RingTimeout { generation: u64 },
}

enum StepOutcome {
    OfferReady {
        adapter: PeerSessionAdapter,
        offer: SessionDescription,
    },
    AnswerReady {
        adapter: PeerSessionAdapter,
        answer: SessionDescription,
    },
    Failed(CallError),
}

struct Session {
    generation: u64,
    role: Role,
    remote: Peer,
    state: CallState,
    adapter: Option<PeerSessionAdapter>,
    /// Callee: the offer, until accepted.
    pending_offer: Option<SessionDescription>,
    ice: IceCandidateBuffer,
    /// Caller: local candidates produced before the offer went out.
    queued_local: Vec<CandidateInit>,
    offer_sent: bool,
    connected_at: Option<DateTime<Utc>>,
    connectivity: Option<ConnectivityState>,
    ring_timer: Option<JoinHandle<()>>,
}

impl Session {
    fn new(generation: u64, role: Role, remote: Peer, state: CallState) -> Self {
        Self {
            generation,
            role,
            remote,
            state,
            adapter: None,
            pending_offer: None,
            ice: IceCandidateBuffer::new(),
            queued_local: Vec::new(),
            offer_sent: false,
            connected_at: None,
            connectivity: None,
            ring_timer: None,
        }
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(h) = self.ring_timer.take() {
            h.abort();
        }
    }

    /// Whether an event claiming to come from `from` belongs to this session.
    fn is_from(&self, from: Option<&PeerId>) -> bool {
        from.map_or(true, |id| id == &self.remote.id)
    }
}

/// Everything a negotiation step needs, detached from the machine.
#[derive(Clone)]
struct StepContext {
    devices: Arc<DeviceManager>,
    factory: Arc<dyn TransportFactory>,
    transport: TransportConfig,
    internal: mpsc::UnboundedSender<Internal>,
}

impl StepContext {
    /// Borrow capture, open a transport and produce our description: an
    /// offer, or (given the remote offer) an answer.
    async fn negotiate(
        &self,
        generation: u64,
        remote_offer: Option<SessionDescription>,
    ) -> Result<(PeerSessionAdapter, SessionDescription), CallError> {
        let tracks = self.devices.acquire_for(generation).await?;
        let internal = self.internal.clone();
        let adapter = PeerSessionAdapter::open(
            self.factory.as_ref(),
            &self.transport,
            generation,
            move |signal| internal.send(Internal::Session { generation, signal }).is_ok(),
        )?;

        let result: Result<SessionDescription, CallError> = async {
            adapter.attach_tracks(&tracks)?;
            match remote_offer {
                None => adapter.create_offer().await,
                Some(offer) => {
                    adapter.apply_remote_description(&offer).await?;
                    adapter.create_answer().await
                }
            }
        }
        .await;

        match result {
            Ok(desc) => Ok((adapter, desc)),
            Err(e) => {
                adapter.dispose();
                Err(e)
            }
        }
    }
}

struct Machine {
    config: CallConfig,
    devices: Arc<DeviceManager>,
    factory: Arc<dyn TransportFactory>,
    gateway: Arc<dyn SignalingGateway>,
    directory: PeerDirectory,
    connected: bool,
    signaling_lost: bool,
    session: Option<Session>,
    generation: u64,
    video_enabled: bool,
    audio_enabled: bool,
    internal: mpsc::UnboundedSender<Internal>,
    snapshot: watch::Sender<SessionSnapshot>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

/// Start the call core. Returns the command handle and the stream of
/// presentation events. The task stops when every handle is dropped.
pub fn spawn(
    config: CallConfig,
    devices: Arc<DeviceManager>,
    factory: Arc<dyn TransportFactory>,
    gateway: Arc<dyn SignalingGateway>,
    mut gateway_events: mpsc::UnboundedReceiver<GatewayEvent>,
) -> (CallHandle, mpsc::UnboundedReceiver<UiEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let pump_tx = internal_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = gateway_events.recv().await {
            if pump_tx.send(Internal::Gateway(event)).is_err() {
                return;
            }
        }
        let _ = pump_tx.send(Internal::GatewayClosed);
    });

    let machine = Machine {
        config,
        devices,
        factory,
        gateway,
        directory: PeerDirectory::new(),
        connected: false,
        signaling_lost: false,
        session: None,
        generation: 0,
        video_enabled: true,
        audio_enabled: true,
        internal: internal_tx,
        snapshot: snapshot_tx,
        ui: ui_tx,
    };
    tokio::spawn(machine.run(cmd_rx, internal_rx));

    (
        CallHandle {
            commands: cmd_tx,
            snapshot: snapshot_rx,
        },
        ui_rx,
    )
}

impl Machine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                Some(input) = internal.recv() => self.on_internal(input).await,
            }
        }
        self.shutdown().await;
    }

    // -- helpers ------------------------------------------------------------

    fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    fn invalid(&self, op: &'static str) -> CallError {
        CallError::InvalidState {
            op,
            state: self.state().to_string(),
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            tracing::trace!("No presentation listener");
        }
    }

    fn current_snapshot(&self) -> SessionSnapshot {
        match &self.session {
            None => SessionSnapshot {
                video_enabled: self.video_enabled,
                audio_enabled: self.audio_enabled,
                ..SessionSnapshot::default()
            },
            Some(s) => SessionSnapshot {
                state: s.state,
                role: Some(s.role),
                remote: Some(s.remote.clone()),
                connected_at: s.connected_at,
                video_enabled: self.video_enabled,
                audio_enabled: self.audio_enabled,
                connectivity: s.connectivity,
            },
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.current_snapshot());
    }

    fn set_state(&mut self, state: CallState) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.state == state {
            return;
        }
        tracing::info!(
            "Session {} with {}: {} -> {}",
            s.generation,
            s.remote.handle,
            s.state,
            state
        );
        s.state = state;
        if state == CallState::Active && s.connected_at.is_none() {
            s.connected_at = Some(Utc::now());
        }
        self.emit(UiEvent::StateChanged(state));
        self.publish();
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    async fn send(&self, signal: OutboundSignal) -> Result<(), CallError> {
        tracing::debug!("Sending {} to {:?}", signal.name(), signal.target());
        self.gateway.send(signal).await
    }

    async fn send_best_effort(&self, signal: OutboundSignal) {
        let name = signal.name();
        if let Err(e) = self.send(signal).await {
            tracing::warn!("Could not send {}: {}", name, e);
        }
    }

    fn step_context(&self) -> StepContext {
        StepContext {
            devices: self.devices.clone(),
            factory: self.factory.clone(),
            transport: self.config.transport.clone(),
            internal: self.internal.clone(),
        }
    }

    fn spawn_step(&self, generation: u64, remote_offer: Option<SessionDescription>) {
        let ctx = self.step_context();
        tokio::spawn(async move {
            let outcome = match ctx.negotiate(generation, remote_offer.clone()).await {
                Ok((adapter, desc)) if remote_offer.is_none() => StepOutcome::OfferReady {
                    adapter,
                    offer: desc,
                },
                Ok((adapter, desc)) => StepOutcome::AnswerReady {
                    adapter,
                    answer: desc,
                },
                Err(e) => StepOutcome::Failed(e),
            };
            let _ = ctx.internal.send(Internal::Step {
                generation,
                outcome,
            });
        });
    }

    fn arm_ring_timer(&mut self) {
        let timeout = self.config.ring_timeout;
        let internal = self.internal.clone();
        if let Some(s) = self.session.as_mut() {
            let generation = s.generation;
            s.cancel_ring_timer();
            s.ring_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = internal.send(Internal::RingTimeout { generation });
            }));
        }
    }

    /// Tear the session down and go back to Idle.
    async fn end_session(&mut self, reason: EndReason) {
        let Some(mut s) = self.session.take() else {
            return;
        };
        self.devices.retire(s.generation);
        s.cancel_ring_timer();
        if let Some(adapter) = s.adapter.take() {
            adapter.dispose();
        }
        s.ice.clear();
        tracing::info!(
            "Session {} with {} ended: {}",
            s.generation,
            s.remote.handle,
            reason
        );
        self.emit(UiEvent::CallEnded {
            peer: s.remote.clone(),
            reason,
        });
        self.emit(UiEvent::StateChanged(CallState::Ended));
        self.publish();
        self.devices.reclaim(s.generation).await;
    }

    /// End the session because of a failure the user should hear about.
    async fn fail_session(&mut self, error: CallError, reason: EndReason) {
        tracing::warn!("Call failed: {}", error);
        self.emit(UiEvent::CallFailed(error));
        self.end_session(reason).await;
    }

    async fn drain_candidates(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some(adapter) = s.adapter.clone() else {
            return;
        };
        if let Err(e) = s.ice.drain_into(&adapter).await {
            tracing::warn!("ICE drain refused: {}", e);
        }
    }

    // -- commands -----------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { peer, reply } => {
                let _ = reply.send(self.start_call(peer));
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept());
            }
            Command::Decline { reply } => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            Command::HangUp { reply } => {
                self.hang_up().await;
                let _ = reply.send(Ok(()));
            }
            Command::SwitchCamera { device_id, reply } => self.switch_camera(device_id, reply),
            Command::SetVideo { enabled, reply } => {
                self.video_enabled = self.devices.set_video_enabled(enabled).await;
                self.media_changed();
                let _ = reply.send(self.video_enabled);
            }
            Command::SetAudio { enabled, reply } => {
                self.audio_enabled = self.devices.set_audio_enabled(enabled).await;
                self.media_changed();
                let _ = reply.send(self.audio_enabled);
            }
            Command::ListCameras { reply } => {
                let devices = self.devices.clone();
                tokio::spawn(async move {
                    let _ = reply.send(devices.list_cameras().await);
                });
            }
            Command::ListMicrophones { reply } => {
                let devices = self.devices.clone();
                tokio::spawn(async move {
                    let _ = reply.send(devices.list_microphones().await);
                });
            }
            Command::RefreshDevices { reply } => {
                let devices = self.devices.clone();
                tokio::spawn(async move {
                    let _ = reply.send(devices.refresh().await);
                });
            }
            Command::StartPreview { reply } => {
                let devices = self.devices.clone();
                let ui = self.ui.clone();
                tokio::spawn(async move {
                    let result = devices.start_preview().await.map(|set| {
                        let _ = ui.send(UiEvent::PreviewChanged {
                            device_id: Some(set.video.device_id().to_string()),
                        });
                    });
                    let _ = reply.send(result);
                });
            }
            Command::StopPreview { reply } => {
                let devices = self.devices.clone();
                let ui = self.ui.clone();
                tokio::spawn(async move {
                    devices.teardown().await;
                    let _ = ui.send(UiEvent::PreviewChanged { device_id: None });
                    let _ = reply.send(());
                });
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.directory.peers().to_vec());
            }
            Command::Search { term, reply } => {
                let _ = reply.send(self.directory.search(&term));
            }
            Command::OutboundDevice { kind, reply } => {
                let device = self
                    .session
                    .as_ref()
                    .and_then(|s| s.adapter.as_ref())
                    .and_then(|a| a.outbound_device(kind));
                let _ = reply.send(device);
            }
        }
    }

    fn start_call(&mut self, peer: PeerId) -> Result<(), CallError> {
        if !self.connected {
            return Err(CallError::SignalingUnreachable("not connected".into()));
        }
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        let remote = self
            .directory
            .get(&peer)
            .cloned()
            .ok_or_else(|| CallError::UnknownPeer(peer.to_string()))?;

        let generation = self.next_generation();
        tracing::info!("Calling {} ({}), session {}", remote.handle, remote.id, generation);
        self.session = Some(Session::new(
            generation,
            Role::Caller,
            remote,
            CallState::Calling,
        ));
        self.spawn_step(generation, None);
        self.emit(UiEvent::StateChanged(CallState::Calling));
        self.publish();
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CallError> {
        if self.state() != CallState::Ringing {
            return Err(self.invalid("accept"));
        }
        let Some(s) = self.session.as_mut() else {
            return Err(self.invalid("accept"));
        };
        s.cancel_ring_timer();
        let generation = s.generation;
        let offer = s
            .pending_offer
            .take()
            .ok_or_else(|| CallError::NegotiationRejected("no offer to answer".into()))?;
        self.set_state(CallState::Negotiating);
        self.spawn_step(generation, Some(offer));
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        let target = match &self.session {
            Some(s) if s.state == CallState::Ringing => s.remote.id.clone(),
            _ => return Err(self.invalid("decline")),
        };
        self.send_best_effort(OutboundSignal::DeclineCall {
            target_id: target,
            reason: None,
        })
        .await;
        self.end_session(EndReason::Declined).await;
        Ok(())
    }

    async fn hang_up(&mut self) {
        let Some(s) = &self.session else {
            return;
        };
        let target_id = s.remote.id.clone();
        match s.state {
            CallState::Ringing => {
                self.send_best_effort(OutboundSignal::DeclineCall {
                    target_id,
                    reason: None,
                })
                .await;
                self.end_session(EndReason::Declined).await;
            }
            // Nothing has gone out yet.
            CallState::Calling => self.end_session(EndReason::LocalHangUp).await,
            _ => {
                self.send_best_effort(OutboundSignal::DisconnectCall { target_id })
                    .await;
                self.end_session(EndReason::LocalHangUp).await;
            }
        }
    }

    fn switch_camera(&self, device_id: String, reply: Reply<()>) {
        // Mid-negotiation the transport is still owned by the step task.
        if matches!(self.state(), CallState::Calling | CallState::Negotiating) {
            let _ = reply.send(Err(self.invalid("switch camera")));
            return;
        }
        let devices = self.devices.clone();
        let adapter = self.session.as_ref().and_then(|s| s.adapter.clone());
        let ui = self.ui.clone();
        tokio::spawn(async move {
            let result = devices.switch_to(&device_id, adapter.as_ref()).await;
            match result {
                Ok(()) => {
                    if let Some(set) = devices.current().await {
                        let _ = ui.send(UiEvent::PreviewChanged {
                            device_id: Some(set.video.device_id().to_string()),
                        });
                    }
                }
                Err(ref e) => tracing::warn!("Camera switch to {} failed: {}", device_id, e),
            }
            let _ = reply.send(result);
        });
    }

    fn media_changed(&self) {
        self.emit(UiEvent::LocalMedia {
            video_enabled: self.video_enabled,
            audio_enabled: self.audio_enabled,
        });
        self.publish();
    }

    // -- inputs -------------------------------------------------------------

    async fn on_internal(&mut self, input: Internal) {
        match input {
            Internal::Gateway(GatewayEvent::Connected { self_id }) => self.on_registered(self_id),
            Internal::Gateway(GatewayEvent::Disconnected { reason }) => {
                self.on_signaling_lost(reason).await
            }
            Internal::Gateway(GatewayEvent::Signal(signal)) => self.on_signal(signal).await,
            Internal::GatewayClosed => self.on_signaling_lost("gateway closed".into()).await,
            Internal::Session { generation, signal } => {
                self.on_session_signal(generation, signal).await
            }
            Internal::Step {
                generation,
                outcome,
            } => self.on_step(generation, outcome).await,
            Internal::RingTimeout { generation } => self.on_ring_timeout(generation).await,
        }
    }

    fn on_registered(&mut self, self_id: PeerId) {
        tracing::info!("Registered with signaling as {}", self_id);
        self.connected = true;
        let changed = self.directory.set_self(self_id.clone());
        self.emit(UiEvent::Registered { self_id });
        if self.signaling_lost {
            self.signaling_lost = false;
            self.emit(UiEvent::SignalingRestored);
        }
        if changed {
            self.emit(UiEvent::RosterChanged(self.directory.peers().to_vec()));
        }
    }

    async fn on_signaling_lost(&mut self, reason: String) {
        self.connected = false;
        if self.session.is_some() {
            self.fail_session(
                CallError::SignalingUnreachable(reason.clone()),
                EndReason::SignalingUnreachable,
            )
            .await;
        }
        if self.directory.clear() {
            self.emit(UiEvent::RosterChanged(Vec::new()));
        }
        if !self.signaling_lost {
            tracing::warn!("Signaling lost: {}", reason);
            self.signaling_lost = true;
            self.emit(UiEvent::SignalingLost { reason });
        }
    }

    async fn on_signal(&mut self, signal: InboundSignal) {
        tracing::debug!("Received {}", signal.name());
        match signal {
            InboundSignal::Welcome { id } => self.on_registered(id),
            InboundSignal::Roster(peers) => self.on_roster(peers).await,
            InboundSignal::Offer { caller_id, offer } => self.on_offer(caller_id, offer).await,
            InboundSignal::Answer { from, answer } => self.on_answer(from, answer).await,
            InboundSignal::IceCandidate { from, candidate } => {
                self.on_remote_candidate(from, candidate).await
            }
            InboundSignal::Disconnect { from } => {
                if self.session.as_ref().map_or(false, |s| s.is_from(from.as_ref())) {
                    self.end_session(EndReason::RemoteHangUp).await;
                } else {
                    tracing::debug!("Ignoring disconnect-call from {:?}", from);
                }
            }
            InboundSignal::Declined { from, reason } => {
                let ours = self.session.as_ref().map_or(false, |s| {
                    s.role == Role::Caller
                        && s.remote.id == from
                        && matches!(s.state, CallState::Calling | CallState::AwaitingAnswer)
                });
                if !ours {
                    tracing::debug!("Ignoring call-declined from {}", from);
                    return;
                }
                let reason = match reason.as_deref() {
                    Some("busy") => EndReason::Busy,
                    _ => EndReason::Declined,
                };
                self.end_session(reason).await;
            }
        }
    }

    async fn on_roster(&mut self, peers: Vec<Peer>) {
        if self.directory.apply_roster(peers) {
            self.emit(UiEvent::RosterChanged(self.directory.peers().to_vec()));
        }
        let gone = self
            .session
            .as_ref()
            .map_or(false, |s| !self.directory.contains(&s.remote.id));
        if gone {
            self.end_session(EndReason::PeerLeft).await;
        }
    }

    async fn on_offer(&mut self, caller_id: PeerId, offer: SessionDescription) {
        if self.session.is_none() {
            let remote = self.directory.get(&caller_id).cloned().unwrap_or(Peer {
                handle: caller_id.to_string(),
                id: caller_id,
            });
            let generation = self.next_generation();
            tracing::info!("Incoming call from {} ({})", remote.handle, remote.id);
            let mut session = Session::new(generation, Role::Callee, remote.clone(), CallState::Ringing);
            session.pending_offer = Some(offer);
            self.session = Some(session);
            self.arm_ring_timer();
            self.emit(UiEvent::IncomingCall(remote));
            self.emit(UiEvent::StateChanged(CallState::Ringing));
            self.publish();
            return;
        }

        let (glare, repeated) = match &self.session {
            Some(s) if s.remote.id == caller_id => (
                s.role == Role::Caller
                    && matches!(s.state, CallState::Calling | CallState::AwaitingAnswer),
                s.role == Role::Callee,
            ),
            _ => (false, false),
        };
        if glare {
            self.resolve_glare(caller_id, offer).await;
        } else if repeated {
            tracing::debug!("Ignoring repeated offer from {}", caller_id);
        } else {
            tracing::info!("Busy: declining offer from {}", caller_id);
            self.send_best_effort(OutboundSignal::DeclineCall {
                target_id: caller_id,
                reason: Some("busy".into()),
            })
            .await;
        }
    }

    /// Both sides called each other. The lower id stays the caller.
    async fn resolve_glare(&mut self, caller_id: PeerId, offer: SessionDescription) {
        let we_win = self
            .directory
            .self_id()
            .map_or(false, |me| me < &caller_id);
        if we_win {
            tracing::info!("Glare with {}: keeping our call", caller_id);
            return;
        }

        let Some(mut old) = self.session.take() else {
            return;
        };
        tracing::info!(
            "Glare with {}: {}; answering their call",
            caller_id,
            EndReason::GlareYielded
        );
        // Capture stays; the new session borrows it next.
        self.devices.retire(old.generation);
        old.cancel_ring_timer();
        if let Some(adapter) = old.adapter.take() {
            adapter.dispose();
        }

        let generation = self.next_generation();
        let mut session = Session::new(
            generation,
            Role::Callee,
            old.remote,
            CallState::Negotiating,
        );
        session.ice = old.ice;
        self.session = Some(session);
        self.spawn_step(generation, Some(offer));
        self.emit(UiEvent::StateChanged(CallState::Negotiating));
        self.publish();
    }

    async fn on_answer(&mut self, from: Option<PeerId>, answer: SessionDescription) {
        let adapter = match &self.session {
            Some(s)
                if s.is_from(from.as_ref())
                    && s.role == Role::Caller
                    && s.state == CallState::AwaitingAnswer =>
            {
                s.adapter.clone()
            }
            _ => None,
        };
        let Some(adapter) = adapter else {
            tracing::debug!("Ignoring unexpected answer from {:?}", from);
            return;
        };

        if let Some(s) = self.session.as_mut() {
            s.cancel_ring_timer();
        }
        self.set_state(CallState::Negotiating);
        match adapter.apply_remote_description(&answer).await {
            Ok(()) => {
                self.drain_candidates().await;
                self.set_state(CallState::Active);
            }
            Err(e) => {
                if let Some(target_id) = self.session.as_ref().map(|s| s.remote.id.clone()) {
                    self.send_best_effort(OutboundSignal::DisconnectCall { target_id })
                        .await;
                }
                self.fail_session(e, EndReason::NegotiationRejected).await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, from: Option<PeerId>, candidate: CandidateInit) {
        let Some(s) = self.session.as_mut() else {
            tracing::debug!("Dropping ICE candidate: no session");
            return;
        };
        if !s.is_from(from.as_ref()) {
            tracing::debug!("Dropping ICE candidate from {:?}", from);
            return;
        }
        match s.adapter.clone() {
            Some(adapter) if adapter.is_remote_applied() => {
                if let Err(e) = adapter.add_candidate(&candidate).await {
                    tracing::warn!("Skipping ICE candidate: {}", e);
                }
            }
            _ => s.ice.push(candidate),
        }
    }

    async fn on_session_signal(&mut self, generation: u64, signal: SessionSignal) {
        let Some(s) = self.session.as_mut().filter(|s| s.generation == generation) else {
            tracing::debug!("Ignoring transport event from ended session {}", generation);
            return;
        };
        let target_id = s.remote.id.clone();
        match signal {
            SessionSignal::LocalCandidate(candidate) => {
                if s.role == Role::Caller && !s.offer_sent {
                    s.queued_local.push(candidate);
                } else {
                    self.send_best_effort(OutboundSignal::IceCandidate {
                        target_id,
                        candidate,
                    })
                    .await;
                }
            }
            SessionSignal::RemoteTrack(track) => {
                tracing::info!("Remote {} track {}", track.kind.as_str(), track.id);
                self.emit(UiEvent::RemoteTrack(track));
            }
            SessionSignal::Connectivity(state) => {
                s.connectivity = Some(state);
                tracing::info!("Connectivity: {}", state.as_str());
                self.emit(UiEvent::Connectivity(state));
                self.publish();
                match state {
                    ConnectivityState::Failed => {
                        self.send_best_effort(OutboundSignal::DisconnectCall { target_id })
                            .await;
                        self.fail_session(CallError::ConnectivityLost, EndReason::ConnectivityLost)
                            .await;
                    }
                    ConnectivityState::Disconnected => {
                        tracing::warn!("Connectivity degraded; waiting for recovery");
                    }
                    _ => {}
                }
            }
        }
    }

    async fn on_step(&mut self, generation: u64, outcome: StepOutcome) {
        let current = self.session.as_ref().map(|s| s.generation) == Some(generation);
        if !current {
            tracing::debug!("Discarding result of ended session {}", generation);
            if let StepOutcome::OfferReady { adapter, .. } | StepOutcome::AnswerReady { adapter, .. } =
                outcome
            {
                adapter.dispose();
            }
            return;
        }

        match outcome {
            StepOutcome::OfferReady { adapter, offer } => {
                let Some(s) = self.session.as_mut() else {
                    return;
                };
                s.adapter = Some(adapter);
                let target_id = s.remote.id.clone();
                let sent = self
                    .send(OutboundSignal::InitiateCall {
                        target_id: target_id.clone(),
                        offer,
                    })
                    .await;
                if let Err(e) = sent {
                    self.fail_session(e, EndReason::SignalingUnreachable).await;
                    return;
                }
                let queued = match self.session.as_mut() {
                    Some(s) => {
                        s.offer_sent = true;
                        std::mem::take(&mut s.queued_local)
                    }
                    None => return,
                };
                for candidate in queued {
                    self.send_best_effort(OutboundSignal::IceCandidate {
                        target_id: target_id.clone(),
                        candidate,
                    })
                    .await;
                }
                self.set_state(CallState::AwaitingAnswer);
                self.arm_ring_timer();
            }
            StepOutcome::AnswerReady { adapter, answer } => {
                let Some(s) = self.session.as_mut() else {
                    return;
                };
                s.adapter = Some(adapter);
                let target_id = s.remote.id.clone();
                if let Err(e) = self
                    .send(OutboundSignal::Answer { target_id, answer })
                    .await
                {
                    self.fail_session(e, EndReason::SignalingUnreachable).await;
                    return;
                }
                self.drain_candidates().await;
                self.set_state(CallState::Active);
            }
            StepOutcome::Failed(e) => {
                let callee_target = self
                    .session
                    .as_ref()
                    .filter(|s| s.role == Role::Callee)
                    .map(|s| s.remote.id.clone());
                // The caller is waiting on our answer; let it go.
                if let Some(target_id) = callee_target {
                    self.send_best_effort(OutboundSignal::DisconnectCall { target_id })
                        .await;
                }
                let reason = EndReason::for_error(&e);
                self.fail_session(e, reason).await;
            }
        }
    }

    async fn on_ring_timeout(&mut self, generation: u64) {
        let Some(s) = self.session.as_ref().filter(|s| s.generation == generation) else {
            return;
        };
        let target_id = s.remote.id.clone();
        match s.state {
            CallState::AwaitingAnswer => {
                self.send_best_effort(OutboundSignal::DisconnectCall { target_id })
                    .await;
            }
            CallState::Ringing => {
                self.send_best_effort(OutboundSignal::DeclineCall {
                    target_id,
                    reason: None,
                })
                .await;
            }
            _ => return,
        }
        tracing::info!("No answer within {:?}", self.config.ring_timeout);
        self.end_session(EndReason::NoAnswer).await;
    }

    async fn shutdown(&mut self) {
        if self.session.is_some() {
            self.hang_up().await;
        }
        self.devices.teardown().await;
        tracing::debug!("Call service stopped");
    }
}

/// Cloneable front door to the call core.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }

    /// Start a call. Returns once the attempt has begun; progress and
    /// failures arrive as snapshots and `UiEvent`s.
    pub async fn call(&self, peer: impl Into<PeerId>) -> Result<(), CallError> {
        let peer = peer.into();
        self.request(|reply| Command::Call { peer, reply }).await?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await?
    }

    /// End whatever is in progress. Idempotent.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await?
    }

    pub async fn switch_camera(&self, device_id: impl Into<String>) -> Result<(), CallError> {
        let device_id = device_id.into();
        self.request(|reply| Command::SwitchCamera { device_id, reply })
            .await?
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::SetVideo { enabled, reply }).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::SetAudio { enabled, reply }).await
    }

    pub async fn list_cameras(&self) -> Result<Vec<Device>, CallError> {
        self.request(|reply| Command::ListCameras { reply }).await?
    }

    pub async fn list_microphones(&self) -> Result<Vec<Device>, CallError> {
        self.request(|reply| Command::ListMicrophones { reply }).await?
    }

    pub async fn refresh_devices(&self) -> Result<Vec<Device>, CallError> {
        self.request(|reply| Command::RefreshDevices { reply }).await?
    }

    pub async fn start_preview(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartPreview { reply }).await?
    }

    pub async fn stop_preview(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StopPreview { reply }).await
    }

    pub async fn roster(&self) -> Result<Vec<Peer>, CallError> {
        self.request(|reply| Command::Roster { reply }).await
    }

    pub async fn search(&self, term: impl Into<String>) -> Result<Vec<Peer>, CallError> {
        let term = term.into();
        self.request(|reply| Command::Search { term, reply }).await
    }

    /// Capture device feeding the active session's sender of `kind`.
    pub async fn outbound_device(&self, kind: TrackKind) -> Result<Option<String>, CallError> {
        self.request(|reply| Command::OutboundDevice { kind, reply })
            .await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, CallError> {
        let mut rx = self.snapshot.clone();
        let snap = rx.wait_for(pred).await.map_err(|_| CallError::Shutdown)?;
        Ok(snap.clone())
    }
}

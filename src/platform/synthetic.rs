//! Synthetic provider: virtual capture devices and a negotiation-complete
//! peer transport.
//!
//! No frames are produced and no packets are sent, but every contract the
//! call core relies on is honored: permission gating and label redaction,
//! busy devices, offer/answer ordering, SDP validation, trickle candidates
//! (only accepted after the remote description), sender replacement and
//! connectivity reporting. Test hooks inject delays and faults.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ice::{self, IceCandidate, IceCredentials};
use super::sdp::{self, DescriptionParams, MediaSection};
use super::{
    CandidateInit, CaptureConstraints, ConnectivityState, Device, DeviceKind, FacingMode,
    LocalTrack, MediaPlatform, PeerTransport, RemoteTrack, SdpKind, SenderInfo,
    SessionDescription, TrackKind, TransportConfig, TransportEvent, TransportFactory, VideoSource,
};
use crate::error::MediaError;

/// Capture permission as the user last answered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Not asked yet; the next acquisition grants it.
    Prompt,
    Granted,
    Denied,
}

struct PlatformState {
    devices: Vec<Device>,
    permission: Permission,
    busy: HashSet<String>,
    acquire_delay: Duration,
    acquisitions: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Virtual capture devices.
pub struct SyntheticPlatform {
    state: Mutex<PlatformState>,
}

impl Default for SyntheticPlatform {
    fn default() -> Self {
        Self::from_camera_labels(&["Front Camera".to_string(), "Back Camera".to_string()])
    }
}

impl SyntheticPlatform {
    /// One camera per label (ids are slugs of the labels) plus a default microphone.
    pub fn from_camera_labels(labels: &[String]) -> Self {
        let mut devices: Vec<Device> = labels
            .iter()
            .map(|label| Device {
                id: format!("cam-{}", slug(label)),
                kind: DeviceKind::Camera,
                label: label.clone(),
            })
            .collect();
        devices.push(Device {
            id: "mic-default".into(),
            kind: DeviceKind::Microphone,
            label: "Default Microphone".into(),
        });
        Self {
            state: Mutex::new(PlatformState {
                devices,
                permission: Permission::Prompt,
                busy: HashSet::new(),
                acquire_delay: Duration::ZERO,
                acquisitions: 0,
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn set_permission(&self, permission: Permission) {
        self.lock().permission = permission;
    }

    /// Mark a device as held by another application.
    #[cfg(test)]
    pub fn set_busy(&self, device_id: &str, busy: bool) {
        let mut s = self.lock();
        if busy {
            s.busy.insert(device_id.to_string());
        } else {
            s.busy.remove(device_id);
        }
    }

    /// Make every acquisition take this long.
    #[cfg(test)]
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.lock().acquire_delay = delay;
    }

    /// Plug in a device (shows up on the next enumeration).
    #[cfg(test)]
    pub fn add_device(&self, device: Device) {
        self.lock().devices.push(device);
    }

    /// Number of successful acquisitions so far.
    #[cfg(test)]
    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    /// Highest number of acquisitions that ever overlapped.
    #[cfg(test)]
    pub fn max_concurrent_acquisitions(&self) -> usize {
        self.lock().max_in_flight
    }

    fn pick_camera(&self, source: &VideoSource) -> Result<Device, MediaError> {
        let s = self.lock();
        let cameras = s.devices.iter().filter(|d| d.kind == DeviceKind::Camera);
        let found = match source {
            VideoSource::Device(id) => cameras
                .clone()
                .find(|d| &d.id == id)
                .ok_or_else(|| MediaError::NotFound(id.clone()))?,
            VideoSource::Facing(facing) => {
                let words: &[&str] = match facing {
                    FacingMode::User => &["front", "user"],
                };
                cameras
                    .clone()
                    .find(|d| {
                        let label = d.label.to_lowercase();
                        words.iter().any(|w| label.contains(w))
                    })
                    .or_else(|| cameras.clone().next())
                    .ok_or_else(|| MediaError::NotFound("no camera".into()))?
            }
        };
        if s.busy.contains(&found.id) {
            return Err(MediaError::Busy(found.id.clone()));
        }
        Ok(found.clone())
    }

    fn pick_microphone(&self) -> Result<Device, MediaError> {
        let s = self.lock();
        let mic = s
            .devices
            .iter()
            .find(|d| d.kind == DeviceKind::Microphone)
            .ok_or_else(|| MediaError::NotFound("no microphone".into()))?;
        if s.busy.contains(&mic.id) {
            return Err(MediaError::Busy(mic.id.clone()));
        }
        Ok(mic.clone())
    }
}

#[async_trait]
impl MediaPlatform for SyntheticPlatform {
    async fn enumerate_capture_devices(&self) -> Result<Vec<Device>, MediaError> {
        let s = self.lock();
        let redact = s.permission != Permission::Granted;
        Ok(s.devices
            .iter()
            .map(|d| Device {
                label: if redact { String::new() } else { d.label.clone() },
                ..d.clone()
            })
            .collect())
    }

    async fn acquire_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        let delay = {
            let mut s = self.lock();
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
            s.acquire_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.acquire_now(constraints);
        let mut s = self.lock();
        s.in_flight -= 1;
        if result.is_ok() {
            s.acquisitions += 1;
        }
        result
    }
}

impl SyntheticPlatform {
    fn acquire_now(&self, constraints: &CaptureConstraints) -> Result<Vec<LocalTrack>, MediaError> {
        {
            let mut s = self.lock();
            match s.permission {
                Permission::Denied => return Err(MediaError::PermissionDenied),
                Permission::Prompt => s.permission = Permission::Granted,
                Permission::Granted => {}
            }
        }

        let mut tracks = Vec::new();
        if let Some(ref source) = constraints.video {
            let cam = self.pick_camera(source)?;
            tracks.push(LocalTrack::new(TrackKind::Video, cam.id, cam.label));
        }
        if constraints.audio {
            let mic = self.pick_microphone()?;
            tracks.push(LocalTrack::new(TrackKind::Audio, mic.id, mic.label));
        }
        Ok(tracks)
    }
}

fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    trimmed.to_string()
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Hands out `SyntheticTransport`s. Test builds remember them for inspection.
#[derive(Default)]
pub struct SyntheticTransportFactory {
    #[cfg(test)]
    created: Mutex<Vec<Arc<SyntheticTransport>>>,
}

impl SyntheticTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far, oldest first.
    #[cfg(test)]
    pub fn transports(&self) -> Vec<Arc<SyntheticTransport>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<Arc<SyntheticTransport>> {
        self.transports().pop()
    }
}

impl TransportFactory for SyntheticTransportFactory {
    fn create(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(SyntheticTransport::new(tx));
        tracing::debug!(
            "Created synthetic transport {} ({} ICE servers)",
            transport.session_id,
            config.ice_servers.len()
        );
        #[cfg(test)]
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(transport.clone());
        Ok((transport, rx))
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

struct TransportState {
    senders: Vec<SenderInfo>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    connectivity: ConnectivityState,
    gathered: bool,
    version: u64,
    closed: bool,
}

/// Negotiation-complete transport without a media plane.
pub struct SyntheticTransport {
    session_id: u64,
    creds: IceCredentials,
    stream_id: String,
    local_ip: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TransportState>,
}

impl SyntheticTransport {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            session_id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            creds: IceCredentials::generate(),
            stream_id: uuid::Uuid::new_v4().to_string(),
            local_ip: "127.0.0.1".into(),
            events,
            state: Mutex::new(TransportState {
                senders: Vec::new(),
                local: None,
                remote: None,
                remote_candidates: Vec::new(),
                connectivity: ConnectivityState::New,
                gathered: false,
                version: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(state: &TransportState) -> Result<()> {
        ensure!(!state.closed, "transport is closed");
        Ok(())
    }

    fn describe(&self, state: &mut TransportState, sections: &[MediaSection]) -> String {
        state.version += 1;
        sdp::build_description(&DescriptionParams {
            session_id: self.session_id,
            version: state.version,
            local_ip: &self.local_ip,
            creds: &self.creds,
            stream_id: &self.stream_id,
            sections,
        })
    }

    fn set_connectivity(&self, state: &mut TransportState, next: ConnectivityState) {
        if state.connectivity != next {
            state.connectivity = next;
            self.emit(TransportEvent::Connectivity(next));
        }
    }

    /// Connecting once both descriptions are in; connected on the first remote candidate.
    fn advance(&self, state: &mut TransportState) {
        if state.local.is_some()
            && state.remote.is_some()
            && state.connectivity == ConnectivityState::New
        {
            self.set_connectivity(state, ConnectivityState::Connecting);
        }
        if state.connectivity == ConnectivityState::Connecting && !state.remote_candidates.is_empty()
        {
            self.set_connectivity(state, ConnectivityState::Connected);
        }
    }

    /// Trickle one host candidate per media section.
    fn gather(&self, state: &mut TransportState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        let base_port = 49152 + (self.session_id % 4096) as u16 * 4;
        for (index, sender) in state.senders.iter().enumerate() {
            let addr = format!("{}:{}", self.local_ip, base_port + index as u16);
            let Ok(addr) = addr.parse() else {
                continue;
            };
            let candidate = ice::host_candidate(addr, 1);
            self.emit(TransportEvent::LocalCandidate(CandidateInit {
                candidate: candidate.to_sdp_line(),
                sdp_mid: Some(sender.id.clone()),
                sdp_m_line_index: Some(index as u16),
            }));
        }
    }

    /// Force a connectivity state (fault injection).
    #[cfg(test)]
    pub fn simulate(&self, next: ConnectivityState) {
        let mut state = self.lock();
        self.set_connectivity(&mut state, next);
    }
}

#[cfg(test)]
impl SyntheticTransport {
    pub fn connectivity(&self) -> ConnectivityState {
        self.lock().connectivity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }
}

#[async_trait]
impl PeerTransport for SyntheticTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(state.local.is_none(), "offer already created");
        ensure!(!state.senders.is_empty(), "no tracks attached");
        let sections: Vec<MediaSection> = state
            .senders
            .iter()
            .map(|s| MediaSection {
                kind: s.kind,
                mid: s.id.clone(),
                track_id: s.track.as_ref().map(|t| t.id().to_string()),
                source: s.track.as_ref().map(|t| t.device_id().to_string()),
            })
            .collect();
        let sdp = self.describe(&mut state, &sections);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        let remote = state
            .remote
            .as_ref()
            .filter(|r| r.kind == SdpKind::Offer)
            .context("no remote offer to answer")?;
        let offer = sdp::parse_description(&remote.sdp)?;

        // Answer section-by-section, mirroring the offer's mids.
        let sections: Vec<MediaSection> = offer
            .sections
            .iter()
            .map(|remote_section| {
                let ours = state
                    .senders
                    .iter()
                    .find(|s| s.kind == remote_section.kind)
                    .and_then(|s| s.track.as_ref());
                MediaSection {
                    kind: remote_section.kind,
                    mid: remote_section.mid.clone(),
                    track_id: ours.map(|t| t.id().to_string()),
                    source: ours.map(|t| t.device_id().to_string()),
                }
            })
            .collect();
        let sdp = self.describe(&mut state, &sections);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(state.local.is_none(), "local description already set");
        match desc.kind {
            SdpKind::Offer => ensure!(
                state.remote.is_none(),
                "cannot apply a local offer after a remote offer"
            ),
            SdpKind::Answer => ensure!(
                state.remote.as_ref().map(|r| r.kind) == Some(SdpKind::Offer),
                "cannot apply a local answer without a remote offer"
            ),
        }
        sdp::parse_description(&desc.sdp).context("invalid local description")?;
        state.local = Some(desc.clone());
        self.gather(&mut state);
        self.advance(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(state.remote.is_none(), "remote description already set");
        let expected = match state.local.as_ref().map(|l| l.kind) {
            None => SdpKind::Offer,
            Some(SdpKind::Offer) => SdpKind::Answer,
            Some(SdpKind::Answer) => bail!("negotiation already complete"),
        };
        ensure!(
            desc.kind == expected,
            "expected remote {:?}, got {:?}",
            expected,
            desc.kind
        );
        let parsed = sdp::parse_description(&desc.sdp).context("invalid remote description")?;

        state.remote = Some(desc.clone());
        state.remote_candidates.extend(parsed.candidates);
        let stream_id = parsed.stream_id.unwrap_or_else(|| "-".into());
        for section in parsed.sections {
            if let Some(track_id) = section.track_id {
                self.emit(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track_id,
                    kind: section.kind,
                    stream_id: stream_id.clone(),
                }));
            }
        }
        self.advance(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &CandidateInit) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(state.remote.is_some(), "remote description not set");
        if candidate.candidate.is_empty() {
            // End-of-candidates marker.
            return Ok(());
        }
        let parsed = ice::parse_candidate(&candidate.candidate)?;
        state.remote_candidates.push(parsed);
        self.advance(&mut state);
        Ok(())
    }

    fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(
            !state.senders.iter().any(|s| s
                .track
                .as_ref()
                .map_or(false, |t| t.same_track(track))),
            "track already added"
        );
        let id = state.senders.len().to_string();
        state.senders.push(SenderInfo {
            id,
            kind: track.kind(),
            track: Some(track.clone()),
        });
        Ok(())
    }

    fn senders(&self) -> Vec<SenderInfo> {
        self.lock().senders.clone()
    }

    async fn replace_track(&self, sender_id: &str, track: &LocalTrack) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        ensure!(track.is_live(), "replacement track has ended");
        let sender = state
            .senders
            .iter_mut()
            .find(|s| s.id == sender_id)
            .with_context(|| format!("no sender {}", sender_id))?;
        ensure!(
            sender.kind == track.kind(),
            "cannot replace {} track with {}",
            sender.kind.as_str(),
            track.kind().as_str()
        );
        sender.track = Some(track.clone());
        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.connectivity = ConnectivityState::Closed;
    }
}

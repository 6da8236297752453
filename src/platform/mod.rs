//! Capability providers: capture devices and the peer media transport.
//!
//! The call core never touches hardware or sockets directly. It talks to a
//! `MediaPlatform` for capture and to a `TransportFactory` for one
//! `PeerTransport` per session. Two providers ship with the crate:
//! `synthetic` (virtual devices, negotiation-complete transport) and, behind
//! cargo features, `native` (V4L2 cameras and cpal microphones).

pub mod ice;
#[cfg(any(feature = "audio", feature = "video-capture"))]
pub mod native;
pub mod sdp;
pub mod synthetic;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::MediaError;

/// Capture device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    Microphone,
}

/// An enumerated capture device. Labels are empty until permission is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Media kind of a track or sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Which way the default camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
}

/// How the video device is picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// Exactly this device id.
    Device(String),
    /// Any camera facing this way.
    Facing(FacingMode),
}

/// Constraints passed to `MediaPlatform::acquire_stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: Option<VideoSource>,
    pub audio: bool,
}

impl CaptureConstraints {
    /// Camera plus microphone. `None` picks the user-facing camera.
    pub fn camera_and_mic(device_id: Option<&str>) -> Self {
        let video = match device_id {
            Some(id) => VideoSource::Device(id.to_string()),
            None => VideoSource::Facing(FacingMode::User),
        };
        Self {
            video: Some(video),
            audio: true,
        }
    }

    /// A single camera, no audio (used for live switching).
    pub fn camera_only(device_id: &str) -> Self {
        Self {
            video: Some(VideoSource::Device(device_id.to_string())),
            audio: false,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    device_id: String,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to a live capture track.
///
/// Clones share the same underlying track: stopping one stops all of them.
/// The device manager holds the owning handle; transports hold senders' clones.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                device_id: device_id.into(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Register a hook that releases the underlying capture resource on `stop()`.
    pub fn with_stop_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.on_stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute/unmute without releasing the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop capture. Idempotent; the stop hook runs once.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            let hook = self
                .inner
                .on_stop
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(hook) = hook {
                hook();
            }
            tracing::debug!(
                "Stopped {} track {} ({})",
                self.kind().as_str(),
                self.id(),
                self.device_id()
            );
        }
    }

    /// True when both handles refer to the same track.
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as it travels over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// An ICE candidate as it travels over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Default public STUN server.
    pub fn default_stun() -> Vec<Self> {
        vec![Self {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: None,
            credential: None,
        }]
    }
}

/// Parameters for creating a peer transport.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Transport-level connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        }
    }
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Events a transport reports after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(CandidateInit),
    RemoteTrack(RemoteTrack),
    Connectivity(ConnectivityState),
}

/// One outbound sender slot of a transport.
#[derive(Debug, Clone)]
pub struct SenderInfo {
    pub id: String,
    pub kind: TrackKind,
    pub track: Option<LocalTrack>,
}

/// Capture capability of the host.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// List capture devices. Labels may be redacted before permission is granted.
    async fn enumerate_capture_devices(&self) -> Result<Vec<Device>, MediaError>;

    /// Open capture per `constraints` and return the resulting live tracks.
    async fn acquire_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError>;
}

/// A NAT-traversing peer media transport (one per session).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: &SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: &CandidateInit) -> anyhow::Result<()>;
    fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()>;
    fn senders(&self) -> Vec<SenderInfo>;
    async fn replace_track(&self, sender_id: &str, track: &LocalTrack) -> anyhow::Result<()>;
    fn close(&self);
}

/// Creates peer transports; each comes with its event stream.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &TransportConfig,
    ) -> anyhow::Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

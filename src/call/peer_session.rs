//! One peer transport per call session.
//!
//! The adapter owns the transport and a pump task that turns transport
//! events into `SessionSignal`s for the state machine. It never talks to
//! signaling itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::ice_buffer::CandidateSink;
use super::MediaTrackSet;
use crate::error::CallError;
use crate::platform::{
    CandidateInit, ConnectivityState, LocalTrack, PeerTransport, RemoteTrack, SessionDescription,
    TrackKind, TransportConfig, TransportEvent, TransportFactory,
};

/// Transport events, as the state machine sees them.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Send this to the remote peer.
    LocalCandidate(CandidateInit),
    RemoteTrack(RemoteTrack),
    Connectivity(ConnectivityState),
}

struct AdapterInner {
    generation: u64,
    transport: Arc<dyn PeerTransport>,
    remote_started: AtomicBool,
    remote_applied: AtomicBool,
    disposed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        if let Some(h) = self.pump.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
        }
    }
}

/// Handle to a session's transport. Clones share it.
#[derive(Clone)]
pub struct PeerSessionAdapter {
    inner: Arc<AdapterInner>,
}

impl PeerSessionAdapter {
    /// Create the transport for session `generation`. `on_signal` receives
    /// every transport event; returning `false` stops the pump.
    pub fn open<F>(
        factory: &dyn TransportFactory,
        config: &TransportConfig,
        generation: u64,
        on_signal: F,
    ) -> Result<Self, CallError>
    where
        F: Fn(SessionSignal) -> bool + Send + 'static,
    {
        let (transport, mut events) = factory
            .create(config)
            .map_err(|e| CallError::NegotiationRejected(format!("transport unavailable: {:#}", e)))?;

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let signal = match event {
                    TransportEvent::LocalCandidate(c) => SessionSignal::LocalCandidate(c),
                    TransportEvent::RemoteTrack(t) => SessionSignal::RemoteTrack(t),
                    TransportEvent::Connectivity(s) => SessionSignal::Connectivity(s),
                };
                if !on_signal(signal) {
                    break;
                }
            }
        });

        tracing::debug!("Peer session {} opened", generation);
        Ok(Self {
            inner: Arc::new(AdapterInner {
                generation,
                transport,
                remote_started: AtomicBool::new(false),
                remote_applied: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                pump: Mutex::new(Some(pump)),
            }),
        })
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    fn negotiation_error(step: &str, e: anyhow::Error) -> CallError {
        CallError::NegotiationRejected(format!("{}: {:#}", step, e))
    }

    /// Add the lent tracks as outbound senders.
    pub fn attach_tracks(&self, tracks: &MediaTrackSet) -> Result<(), CallError> {
        for track in tracks.tracks() {
            self.inner
                .transport
                .add_track(track)
                .map_err(|e| Self::negotiation_error("add track", e))?;
        }
        Ok(())
    }

    /// Create an offer and apply it locally.
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let t = &self.inner.transport;
        let offer = t
            .create_offer()
            .await
            .map_err(|e| Self::negotiation_error("create offer", e))?;
        t.set_local_description(&offer)
            .await
            .map_err(|e| Self::negotiation_error("apply local offer", e))?;
        Ok(offer)
    }

    /// Create an answer and apply it locally.
    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let t = &self.inner.transport;
        let answer = t
            .create_answer()
            .await
            .map_err(|e| Self::negotiation_error("create answer", e))?;
        t.set_local_description(&answer)
            .await
            .map_err(|e| Self::negotiation_error("apply local answer", e))?;
        Ok(answer)
    }

    /// Apply the remote description. Accepted once per session.
    pub async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        if self.inner.remote_started.swap(true, Ordering::SeqCst) {
            return Err(CallError::NegotiationRejected(
                "remote description already applied".into(),
            ));
        }
        self.inner
            .transport
            .set_remote_description(desc)
            .await
            .map_err(|e| Self::negotiation_error("apply remote description", e))?;
        self.inner.remote_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_remote_applied(&self) -> bool {
        self.inner.remote_applied.load(Ordering::SeqCst)
    }

    pub async fn add_candidate(&self, candidate: &CandidateInit) -> Result<(), CallError> {
        self.inner
            .transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Self::negotiation_error("add candidate", e))
    }

    /// Swap the outbound track of the same kind, without renegotiation.
    pub async fn replace_outbound_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let sender = self
            .inner
            .transport
            .senders()
            .into_iter()
            .find(|s| s.kind == track.kind())
            .ok_or_else(|| {
                CallError::SwitchFailed(format!("no {} sender", track.kind().as_str()))
            })?;
        self.inner
            .transport
            .replace_track(&sender.id, track)
            .await
            .map_err(|e| CallError::SwitchFailed(format!("{:#}", e)))
    }

    /// Capture device feeding the outbound sender of `kind`.
    pub fn outbound_device(&self, kind: TrackKind) -> Option<String> {
        self.inner
            .transport
            .senders()
            .into_iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.track.map(|t| t.device_id().to_string()))
    }

    /// Release the transport. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(h) = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            h.abort();
        }
        self.inner.transport.close();
        tracing::debug!("Peer session {} disposed", self.inner.generation);
    }

    #[cfg(test)]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateSink for PeerSessionAdapter {
    fn remote_description_applied(&self) -> bool {
        self.is_remote_applied()
    }

    async fn add_candidate(&self, candidate: &CandidateInit) -> Result<(), CallError> {
        PeerSessionAdapter::add_candidate(self, candidate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::IceCandidateBuffer;
    use crate::platform::synthetic::SyntheticTransportFactory;
    use tokio::sync::mpsc;

    fn tracks(cam: &str) -> MediaTrackSet {
        MediaTrackSet {
            video: LocalTrack::new(TrackKind::Video, cam, "Camera"),
            audio: LocalTrack::new(TrackKind::Audio, "mic", "Mic"),
        }
    }

    fn open(
        factory: &SyntheticTransportFactory,
        generation: u64,
    ) -> (PeerSessionAdapter, mpsc::UnboundedReceiver<SessionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = PeerSessionAdapter::open(
            factory,
            &TransportConfig::default(),
            generation,
            move |s| tx.send(s).is_ok(),
        )
        .unwrap();
        (adapter, rx)
    }

    #[tokio::test]
    async fn test_offer_answer_and_buffered_candidates() {
        let factory = SyntheticTransportFactory::new();
        let (caller, mut caller_rx) = open(&factory, 1);
        let (callee, _callee_rx) = open(&factory, 2);
        caller.attach_tracks(&tracks("cam-a")).unwrap();
        callee.attach_tracks(&tracks("cam-b")).unwrap();

        let offer = caller.create_offer().await.unwrap();

        // Caller candidates reach the callee before it applies the offer.
        let mut buffer = IceCandidateBuffer::new();
        for _ in 0..2 {
            match caller_rx.recv().await.unwrap() {
                SessionSignal::LocalCandidate(c) => buffer.push(c),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(buffer.drain_into(&callee).await.is_err());

        callee.apply_remote_description(&offer).await.unwrap();
        let report = buffer.drain_into(&callee).await.unwrap();
        assert_eq!(report.applied, 2);
        assert!(buffer.is_empty());

        let answer = callee.create_answer().await.unwrap();
        caller.apply_remote_description(&answer).await.unwrap();
        assert!(matches!(
            caller.apply_remote_description(&answer).await,
            Err(CallError::NegotiationRejected(_))
        ));

        let transport = &factory.transports()[1];
        assert_eq!(transport.remote_candidates().len(), 2);
        assert_eq!(transport.connectivity(), ConnectivityState::Connected);
    }

    #[tokio::test]
    async fn test_replace_outbound_track() {
        let factory = SyntheticTransportFactory::new();
        let (adapter, _rx) = open(&factory, 1);
        adapter.attach_tracks(&tracks("cam-a")).unwrap();
        assert_eq!(adapter.outbound_device(TrackKind::Video).as_deref(), Some("cam-a"));

        let back = LocalTrack::new(TrackKind::Video, "cam-b", "Back");
        adapter.replace_outbound_track(&back).await.unwrap();
        assert_eq!(adapter.outbound_device(TrackKind::Video).as_deref(), Some("cam-b"));
        assert_eq!(adapter.outbound_device(TrackKind::Audio).as_deref(), Some("mic"));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let factory = SyntheticTransportFactory::new();
        let (adapter, _rx) = open(&factory, 1);
        adapter.dispose();
        adapter.dispose();
        assert!(adapter.is_disposed());
        assert!(factory.last().unwrap().is_closed());
        assert!(adapter.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_connectivity_is_forwarded() {
        let factory = SyntheticTransportFactory::new();
        let (_adapter, mut rx) = open(&factory, 1);
        factory.last().unwrap().simulate(ConnectivityState::Failed);
        assert_eq!(
            rx.recv().await,
            Some(SessionSignal::Connectivity(ConnectivityState::Failed))
        );
    }
}

//! Capture device manager.
//!
//! Owns the local track set. A call session borrows it (`acquire_for`) and
//! gives it back (`reclaim`); sessions are identified by generation. Every
//! acquisition and switch runs under one async lock, so there is never more
//! than one outstanding request to the platform.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::PeerSessionAdapter;
use crate::error::{CallError, MediaError};
use crate::platform::{
    CaptureConstraints, Device, DeviceKind, LocalTrack, MediaPlatform, TrackKind,
};

/// Labels that mark cameras not meant for calls.
const HIDDEN_CAMERA_WORDS: &[&str] = &["depth", "infrared", "ir", "virtual", "dummy"];

/// One video and one audio track.
#[derive(Debug, Clone)]
pub struct MediaTrackSet {
    pub video: LocalTrack,
    pub audio: LocalTrack,
}

impl MediaTrackSet {
    fn from_tracks(tracks: Vec<LocalTrack>) -> Result<Self, CallError> {
        let mut video = None;
        let mut audio = None;
        for t in tracks {
            let slot = match t.kind() {
                TrackKind::Video => &mut video,
                TrackKind::Audio => &mut audio,
            };
            match slot {
                None => *slot = Some(t),
                // Extra tracks are not ours to keep.
                Some(_) => t.stop(),
            }
        }
        match (video, audio) {
            (Some(video), Some(audio)) => Ok(Self { video, audio }),
            (video, audio) => {
                for t in video.iter().chain(audio.iter()) {
                    t.stop();
                }
                Err(CallError::DeviceUnavailable(
                    "capture did not yield both camera and microphone".into(),
                ))
            }
        }
    }

    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.video, &self.audio]
    }

    fn stop(&self) {
        self.video.stop();
        self.audio.stop();
    }
}

struct DeviceState {
    /// Last enumeration; `None` until the first listing.
    devices: Option<Vec<Device>>,
    permission_granted: bool,
    tracks: Option<MediaTrackSet>,
    preview: bool,
    lent_to: Option<u64>,
    video_enabled: bool,
    audio_enabled: bool,
    preferred_camera: Option<String>,
}

/// Enumerates, acquires, lends and switches capture devices.
pub struct DeviceManager {
    platform: Arc<dyn MediaPlatform>,
    keep_between_calls: bool,
    /// Highest session generation that has ended.
    retired: AtomicU64,
    state: Mutex<DeviceState>,
}

impl DeviceManager {
    pub fn new(
        platform: Arc<dyn MediaPlatform>,
        preferred_camera: Option<String>,
        keep_between_calls: bool,
    ) -> Self {
        Self {
            platform,
            keep_between_calls,
            retired: AtomicU64::new(0),
            state: Mutex::new(DeviceState {
                devices: None,
                permission_granted: false,
                tracks: None,
                preview: false,
                lent_to: None,
                video_enabled: true,
                audio_enabled: true,
                preferred_camera,
            }),
        }
    }

    /// Cameras suitable for calls. Fails `PermissionDenied` until a first
    /// successful `acquire`.
    pub async fn list_cameras(&self) -> Result<Vec<Device>, CallError> {
        let devices = self.listing(false).await?;
        Ok(filter_cameras(&devices))
    }

    pub async fn list_microphones(&self) -> Result<Vec<Device>, CallError> {
        let devices = self.listing(false).await?;
        Ok(of_kind(&devices, DeviceKind::Microphone))
    }

    /// Re-enumerate now and return the cameras.
    pub async fn refresh(&self) -> Result<Vec<Device>, CallError> {
        let devices = self.listing(true).await?;
        tracing::info!("Device list refreshed: {} devices", devices.len());
        Ok(filter_cameras(&devices))
    }

    async fn listing(&self, force: bool) -> Result<Vec<Device>, CallError> {
        let mut st = self.state.lock().await;
        if !st.permission_granted {
            return Err(CallError::PermissionDenied);
        }
        if force || st.devices.is_none() {
            let devices = self.platform.enumerate_capture_devices().await?;
            st.devices = Some(devices);
        }
        Ok(st.devices.clone().unwrap_or_default())
    }

    /// The current track set, acquiring one if needed. `device_id` only
    /// matters for a fresh acquisition; `None` uses the preferred camera or
    /// the user-facing default.
    pub async fn acquire(&self, device_id: Option<&str>) -> Result<MediaTrackSet, CallError> {
        let mut st = self.state.lock().await;
        self.acquire_locked(&mut st, device_id).await.map(|(set, _)| set)
    }

    async fn acquire_locked(
        &self,
        st: &mut DeviceState,
        device_id: Option<&str>,
    ) -> Result<(MediaTrackSet, bool), CallError> {
        if let Some(set) = st.tracks.clone() {
            if set.video.is_live() && set.audio.is_live() {
                return Ok((set, false));
            }
            set.stop();
            st.tracks = None;
        }

        let camera = device_id
            .map(str::to_string)
            .or_else(|| st.preferred_camera.clone());
        let constraints = CaptureConstraints::camera_and_mic(camera.as_deref());
        let tracks = match self.platform.acquire_stream(&constraints).await {
            Ok(t) => t,
            Err(MediaError::NotFound(_)) if camera.is_some() && device_id.is_none() => {
                // Stale preference; fall back to the default camera.
                tracing::warn!("Preferred camera {:?} not found, using default", camera);
                self.platform
                    .acquire_stream(&CaptureConstraints::camera_and_mic(None))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        st.permission_granted = true;

        let set = MediaTrackSet::from_tracks(tracks)?;
        set.video.set_enabled(st.video_enabled);
        set.audio.set_enabled(st.audio_enabled);
        tracing::info!(
            "Acquired capture: camera {} ({}), microphone {}",
            set.video.device_id(),
            set.video.label(),
            set.audio.device_id()
        );
        st.tracks = Some(set.clone());
        Ok((set, true))
    }

    /// Mark session `generation` (and all older ones) as over.
    pub fn retire(&self, generation: u64) {
        self.retired.fetch_max(generation, Ordering::SeqCst);
    }

    fn is_retired(&self, generation: u64) -> bool {
        generation <= self.retired.load(Ordering::SeqCst)
    }

    /// Acquire (if needed) and lend the track set to session `generation`.
    ///
    /// Fails while a different live session holds the tracks. A session
    /// that was retired while this was in flight gets an error, and capture
    /// opened on its behalf is released.
    pub async fn acquire_for(&self, generation: u64) -> Result<MediaTrackSet, CallError> {
        let mut st = self.state.lock().await;
        let stale = || CallError::InvalidState {
            op: "lend capture",
            state: "session ended".into(),
        };
        if self.is_retired(generation) {
            return Err(stale());
        }
        if let Some(holder) = st.lent_to {
            if holder != generation && !self.is_retired(holder) {
                return Err(CallError::DeviceUnavailable(format!(
                    "capture is in use by session {}",
                    holder
                )));
            }
        }

        let (set, fresh) = self.acquire_locked(&mut st, None).await?;
        if self.is_retired(generation) {
            if fresh && !st.preview {
                set.stop();
                st.tracks = None;
            }
            return Err(stale());
        }
        if let Some(old) = st.lent_to.replace(generation) {
            if old != generation {
                tracing::debug!("Capture moved from ended session {} to {}", old, generation);
            }
        }
        Ok(set)
    }

    /// Return the tracks lent to `generation`. Capture stops unless a
    /// preview holds it or the config keeps it between calls.
    pub async fn reclaim(&self, generation: u64) {
        let mut st = self.state.lock().await;
        if st.lent_to == Some(generation) {
            st.lent_to = None;
        }
        if st.lent_to.is_none() && !st.preview && !self.keep_between_calls {
            if let Some(set) = st.tracks.take() {
                set.stop();
                tracing::debug!("Capture released after session {}", generation);
            }
        }
    }

    /// Replace the camera. The new track is acquired and handed to
    /// `adapter` before the old one is stopped; on any failure the old
    /// track stays live and this returns `SwitchFailed`.
    ///
    /// While a live session borrows the tracks, `adapter` must be that
    /// session's; otherwise the switch is refused.
    pub async fn switch_to(
        &self,
        device_id: &str,
        adapter: Option<&PeerSessionAdapter>,
    ) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        let Some(current) = st.tracks.clone() else {
            // Nothing live yet: remember it for the next acquisition.
            st.preferred_camera = Some(device_id.to_string());
            return Ok(());
        };
        if current.video.device_id() == device_id && current.video.is_live() {
            return Ok(());
        }
        if let Some(holder) = st.lent_to.filter(|g| !self.is_retired(*g)) {
            if adapter.map(PeerSessionAdapter::generation) != Some(holder) {
                return Err(CallError::SwitchFailed(format!(
                    "capture is lent to session {} and its transport was not given",
                    holder
                )));
            }
        }

        let tracks = self
            .platform
            .acquire_stream(&CaptureConstraints::camera_only(device_id))
            .await
            .map_err(|e| CallError::SwitchFailed(e.to_string()))?;
        let mut new_video = None;
        for t in tracks {
            if t.kind() == TrackKind::Video && new_video.is_none() {
                new_video = Some(t);
            } else {
                t.stop();
            }
        }
        let new_video = new_video
            .ok_or_else(|| CallError::SwitchFailed(format!("{} yielded no video", device_id)))?;
        new_video.set_enabled(st.video_enabled);

        if let Some(adapter) = adapter {
            if let Err(e) = adapter.replace_outbound_track(&new_video).await {
                new_video.stop();
                return Err(e);
            }
        }

        let old_video = std::mem::replace(
            &mut st
                .tracks
                .as_mut()
                .ok_or_else(|| CallError::SwitchFailed("capture released".into()))?
                .video,
            new_video,
        );
        old_video.stop();
        st.preferred_camera = Some(device_id.to_string());
        tracing::info!(
            "Switched camera {} -> {}",
            old_video.device_id(),
            device_id
        );
        Ok(())
    }

    /// Enable/disable the camera track. Returns the resulting flag; without
    /// capture this is a no-op.
    pub async fn set_video_enabled(&self, enabled: bool) -> bool {
        let mut st = self.state.lock().await;
        if let Some(ref set) = st.tracks {
            set.video.set_enabled(enabled);
            st.video_enabled = enabled;
        }
        st.video_enabled
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> bool {
        let mut st = self.state.lock().await;
        if let Some(ref set) = st.tracks {
            set.audio.set_enabled(enabled);
            st.audio_enabled = enabled;
        }
        st.audio_enabled
    }

    /// Acquire for local preview; the tracks then outlive calls until `teardown`.
    pub async fn start_preview(&self) -> Result<MediaTrackSet, CallError> {
        let mut st = self.state.lock().await;
        let (set, _) = self.acquire_locked(&mut st, None).await?;
        st.preview = true;
        Ok(set)
    }

    /// Stop the preview and any capture no session is borrowing.
    pub async fn teardown(&self) {
        let mut st = self.state.lock().await;
        st.preview = false;
        if st.lent_to.map_or(false, |g| !self.is_retired(g)) {
            return;
        }
        st.lent_to = None;
        if let Some(set) = st.tracks.take() {
            set.stop();
            tracing::debug!("Capture torn down");
        }
    }

    pub async fn current(&self) -> Option<MediaTrackSet> {
        self.state.lock().await.tracks.clone()
    }

    #[cfg(test)]
    pub async fn is_previewing(&self) -> bool {
        self.state.lock().await.preview
    }

    #[cfg(test)]
    pub async fn media_flags(&self) -> (bool, bool) {
        let st = self.state.lock().await;
        (st.video_enabled, st.audio_enabled)
    }
}

fn of_kind(devices: &[Device], kind: DeviceKind) -> Vec<Device> {
    devices.iter().filter(|d| d.kind == kind).cloned().collect()
}

fn is_hidden_camera(label: &str) -> bool {
    label
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| HIDDEN_CAMERA_WORDS.contains(&word))
}

/// Drop depth/IR/virtual cameras, unless that would leave nothing.
fn filter_cameras(devices: &[Device]) -> Vec<Device> {
    let cameras = of_kind(devices, DeviceKind::Camera);
    let usable: Vec<Device> = cameras
        .iter()
        .filter(|d| !is_hidden_camera(&d.label))
        .cloned()
        .collect();
    if usable.is_empty() {
        cameras
    } else {
        usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::synthetic::{Permission, SyntheticPlatform};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn manager(platform: Arc<SyntheticPlatform>) -> DeviceManager {
        DeviceManager::new(platform, None, false)
    }

    fn labels(names: &[&str]) -> Arc<SyntheticPlatform> {
        Arc::new(SyntheticPlatform::from_camera_labels(
            &names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn test_listing_requires_permission() {
        let dm = manager(labels(&["Front Camera", "Back Camera"]));
        assert_eq!(dm.list_cameras().await, Err(CallError::PermissionDenied));

        assert_ok!(dm.acquire(None).await);
        let cams = dm.list_cameras().await.unwrap();
        assert_eq!(cams.len(), 2);
        assert!(cams.iter().all(|d| !d.label.is_empty()));
        assert_eq!(dm.list_microphones().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listing_is_cached_until_refresh() {
        let platform = labels(&["Front Camera"]);
        let dm = manager(platform.clone());
        dm.acquire(None).await.unwrap();
        assert_eq!(dm.list_cameras().await.unwrap().len(), 1);

        platform.add_device(Device {
            id: "cam-usb".into(),
            kind: DeviceKind::Camera,
            label: "USB Camera".into(),
        });
        assert_eq!(dm.list_cameras().await.unwrap().len(), 1);
        assert_eq!(dm.refresh().await.unwrap().len(), 2);
    }

    #[test]
    fn test_camera_filter() {
        let cam = |id: &str, label: &str| Device {
            id: id.into(),
            kind: DeviceKind::Camera,
            label: label.into(),
        };
        let devices = vec![
            cam("a", "Integrated Camera"),
            cam("b", "Integrated IR Camera"),
            cam("c", "Intel RealSense Depth"),
            cam("d", "OBS Virtual Camera"),
            cam("e", "Mirage Pro"),
        ];
        let ids: Vec<_> = filter_cameras(&devices).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "e"]);

        // Only hidden kinds present: keep them rather than show nothing.
        let only_ir = vec![cam("b", "IR Camera")];
        assert_eq!(filter_cameras(&only_ir).len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_maps() {
        let platform = labels(&["Front Camera"]);
        platform.set_permission(Permission::Denied);
        let dm = manager(platform);
        assert_eq!(dm.acquire(None).await.unwrap_err(), CallError::PermissionDenied);
    }

    #[tokio::test]
    async fn test_lend_and_reclaim() {
        let dm = manager(labels(&["Front Camera"]));
        let set = dm.acquire_for(1).await.unwrap();
        assert_err!(dm.acquire_for(2).await);

        dm.retire(1);
        dm.reclaim(1).await;
        assert!(!set.video.is_live());
        assert!(dm.current().await.is_none());

        // Retired generations cannot borrow again.
        assert_err!(dm.acquire_for(1).await);
        assert_ok!(dm.acquire_for(2).await);
    }

    #[tokio::test]
    async fn test_preview_survives_reclaim() {
        let dm = manager(labels(&["Front Camera"]));
        let preview = dm.start_preview().await.unwrap();
        let lent = dm.acquire_for(1).await.unwrap();
        assert!(preview.video.same_track(&lent.video));

        dm.retire(1);
        dm.reclaim(1).await;
        assert!(preview.video.is_live());

        dm.teardown().await;
        assert!(!preview.video.is_live());
        assert!(!dm.is_previewing().await);
    }

    #[tokio::test]
    async fn test_retired_while_acquiring_releases_capture() {
        let platform = labels(&["Front Camera"]);
        platform.set_acquire_delay(Duration::from_millis(50));
        let dm = Arc::new(manager(platform.clone()));

        let dm2 = dm.clone();
        let pending = tokio::spawn(async move { dm2.acquire_for(1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        dm.retire(1);

        assert_err!(pending.await.unwrap());
        assert!(dm.current().await.is_none());
        assert_eq!(platform.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_switch_keeps_old_track_on_failure() {
        let platform = labels(&["Front Camera", "Back Camera"]);
        let dm = manager(platform.clone());
        let set = dm.acquire(None).await.unwrap();
        assert_eq!(set.video.device_id(), "cam-front-camera");

        platform.set_busy("cam-back-camera", true);
        let err = dm.switch_to("cam-back-camera", None).await.unwrap_err();
        assert!(matches!(err, CallError::SwitchFailed(_)));
        assert!(set.video.is_live());

        platform.set_busy("cam-back-camera", false);
        dm.switch_to("cam-back-camera", None).await.unwrap();
        assert!(!set.video.is_live());
        let now = dm.current().await.unwrap();
        assert_eq!(now.video.device_id(), "cam-back-camera");
        assert!(now.audio.same_track(&set.audio));
    }

    #[tokio::test]
    async fn test_switch_refused_while_lent_without_transport() {
        let dm = manager(labels(&["Front Camera", "Back Camera"]));
        let lent = dm.acquire_for(1).await.unwrap();

        let err = dm.switch_to("cam-back-camera", None).await.unwrap_err();
        assert!(matches!(err, CallError::SwitchFailed(_)));
        assert!(lent.video.is_live());
        let now = dm.current().await.unwrap();
        assert!(now.video.same_track(&lent.video));

        // Once the session is over the camera is free to move.
        dm.retire(1);
        assert_ok!(dm.switch_to("cam-back-camera", None).await);
        assert!(!lent.video.is_live());
    }

    #[tokio::test]
    async fn test_concurrent_switches_are_serialized() {
        let platform = labels(&["Front Camera", "Back Camera", "Side Camera"]);
        platform.set_acquire_delay(Duration::from_millis(20));
        let dm = Arc::new(manager(platform.clone()));
        dm.acquire(None).await.unwrap();

        let a = {
            let dm = dm.clone();
            tokio::spawn(async move { dm.switch_to("cam-back-camera", None).await })
        };
        let b = {
            let dm = dm.clone();
            tokio::spawn(async move { dm.switch_to("cam-side-camera", None).await })
        };
        assert_ok!(a.await.unwrap());
        assert_ok!(b.await.unwrap());
        assert_eq!(platform.max_concurrent_acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_toggles() {
        let dm = manager(labels(&["Front Camera"]));
        // No capture yet: nothing changes.
        assert!(dm.set_video_enabled(false).await);

        let set = dm.acquire(None).await.unwrap();
        assert!(!dm.set_video_enabled(false).await);
        assert!(!set.video.is_enabled());
        assert!(set.video.is_live());
        assert!(!dm.set_audio_enabled(false).await);
        assert_eq!(dm.media_flags().await, (false, false));
    }
}

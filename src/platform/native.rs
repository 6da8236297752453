//! Native capture provider: V4L2 cameras (`video-capture` feature) and cpal
//! microphones (`audio` feature).
//!
//! Acquired devices are held open by a dedicated OS thread per track; the
//! track's stop hook tells that thread to exit, which releases the device.
//! Frames are consumed and counted but not forwarded anywhere. Encoding and
//! transport are the peer transport's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{CaptureConstraints, Device, DeviceKind, LocalTrack, MediaPlatform, TrackKind};
#[cfg(feature = "video-capture")]
use super::{FacingMode, VideoSource};
use crate::error::MediaError;

/// Host capture devices.
#[derive(Default)]
pub struct NativePlatform {
    frames: Arc<AtomicU64>,
}

impl NativePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames (video) and callbacks (audio) seen across all live tracks.
    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "video-capture")]
fn io_error(id: &str, e: std::io::Error) -> MediaError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => MediaError::PermissionDenied,
        std::io::ErrorKind::NotFound => MediaError::NotFound(id.to_string()),
        // EBUSY
        _ if e.raw_os_error() == Some(16) => MediaError::Busy(id.to_string()),
        _ => MediaError::Platform(format!("{}: {}", id, e)),
    }
}

#[async_trait]
impl MediaPlatform for NativePlatform {
    async fn enumerate_capture_devices(&self) -> Result<Vec<Device>, MediaError> {
        tokio::task::spawn_blocking(|| {
            let mut devices = Vec::new();
            #[cfg(feature = "video-capture")]
            devices.extend(cameras::enumerate());
            #[cfg(feature = "audio")]
            devices.extend(microphones::enumerate()?);
            Ok(devices)
        })
        .await
        .map_err(|e| MediaError::Platform(e.to_string()))?
    }

    async fn acquire_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        let constraints = constraints.clone();
        let frames = self.frames.clone();
        tokio::task::spawn_blocking(move || {
            let mut tracks: Vec<LocalTrack> = Vec::new();
            let result = acquire_blocking(&constraints, &frames, &mut tracks);
            if result.is_err() {
                // Release whatever opened before the failure.
                for t in &tracks {
                    t.stop();
                }
            }
            result.map(|_| tracks)
        })
        .await
        .map_err(|e| MediaError::Platform(e.to_string()))?
    }
}

fn acquire_blocking(
    constraints: &CaptureConstraints,
    frames: &Arc<AtomicU64>,
    tracks: &mut Vec<LocalTrack>,
) -> Result<(), MediaError> {
    if let Some(ref _source) = constraints.video {
        #[cfg(feature = "video-capture")]
        {
            let node = cameras::resolve(_source)?;
            tracks.push(cameras::open(&node, frames.clone())?);
        }
        #[cfg(not(feature = "video-capture"))]
        return Err(MediaError::NotFound("camera support not built".into()));
    }
    if constraints.audio {
        #[cfg(feature = "audio")]
        tracks.push(microphones::open(frames.clone())?);
        #[cfg(not(feature = "audio"))]
        return Err(MediaError::NotFound("microphone support not built".into()));
    }
    let _ = frames;
    Ok(())
}

#[cfg(feature = "video-capture")]
mod cameras {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    pub struct Node {
        pub id: String,
        pub label: String,
    }

    fn nodes() -> Vec<Node> {
        v4l::context::enum_devices()
            .into_iter()
            .map(|n| Node {
                id: n.path().display().to_string(),
                label: n.name().unwrap_or_else(|| format!("Video device {}", n.index())),
            })
            .collect()
    }

    pub fn enumerate() -> Vec<Device> {
        nodes()
            .into_iter()
            .map(|n| Device {
                id: n.id,
                kind: DeviceKind::Camera,
                label: n.label,
            })
            .collect()
    }

    pub fn resolve(source: &VideoSource) -> Result<Node, MediaError> {
        let mut all = nodes();
        match source {
            VideoSource::Device(id) => all
                .into_iter()
                .find(|n| &n.id == id)
                .ok_or_else(|| MediaError::NotFound(id.clone())),
            VideoSource::Facing(facing) => {
                let words: &[&str] = match facing {
                    FacingMode::User => &["front", "user", "integrated", "webcam"],
                };
                let pos = all.iter().position(|n| {
                    let label = n.label.to_lowercase();
                    words.iter().any(|w| label.contains(w))
                });
                match pos {
                    Some(i) => Ok(all.swap_remove(i)),
                    None if !all.is_empty() => Ok(all.swap_remove(0)),
                    None => Err(MediaError::NotFound("no camera".into())),
                }
            }
        }
    }

    /// Open the node and keep it streaming on a capture thread until stopped.
    pub fn open(node: &Node, frames: Arc<AtomicU64>) -> Result<LocalTrack, MediaError> {
        let dev = v4l::Device::with_path(&node.id).map_err(|e| io_error(&node.id, e))?;
        let fmt = dev.format().map_err(|e| io_error(&node.id, e))?;
        tracing::info!(
            "Camera opened: {} {}x{} fourcc={}",
            node.id,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let path = node.id.clone();
        std::thread::spawn(move || {
            let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, 4) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to start V4L2 stream on {}: {}", path, e);
                    return;
                }
            };
            while !stop_flag.load(Ordering::SeqCst) {
                match stream.next() {
                    Ok(_) => {
                        frames.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!("Camera capture on {} ended: {}", path, e);
                        break;
                    }
                }
            }
            tracing::debug!("Camera capture thread for {} exited", path);
        });

        Ok(
            LocalTrack::new(TrackKind::Video, node.id.clone(), node.label.clone())
                .with_stop_hook(move || stop.store(true, Ordering::SeqCst)),
        )
    }
}

#[cfg(feature = "audio")]
mod microphones {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    pub fn enumerate() -> Result<Vec<Device>, MediaError> {
        let host = cpal::default_host();
        let inputs = host
            .input_devices()
            .map_err(|e| MediaError::Platform(e.to_string()))?;
        Ok(inputs
            .filter_map(|d| d.name().ok())
            .map(|name| Device {
                id: name.clone(),
                kind: DeviceKind::Microphone,
                label: name,
            })
            .collect())
    }

    fn build<T: cpal::SizedSample>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        frames: Arc<AtomicU64>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError> {
        device.build_input_stream(
            config,
            move |_data: &[T], _: &cpal::InputCallbackInfo| {
                frames.fetch_add(1, Ordering::Relaxed);
            },
            |err| tracing::warn!("Audio input stream error: {}", err),
            None,
        )
    }

    /// Open the default input device; the stream lives on its own thread
    /// until the track's stop hook drops the keep-alive sender.
    pub fn open(frames: Arc<AtomicU64>) -> Result<LocalTrack, MediaError> {
        let (keep_tx, keep_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, MediaError>>();

        std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                let _ = ready_tx.send(Err(MediaError::NotFound("no microphone".into())));
                return;
            };
            let name = device.name().unwrap_or_else(|_| "unknown".into());
            let supported = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::Platform(e.to_string())));
                    return;
                }
            };
            let config = supported.config();
            let stream = match supported.sample_format() {
                cpal::SampleFormat::F32 => build::<f32>(&device, &config, frames),
                cpal::SampleFormat::I16 => build::<i16>(&device, &config, frames),
                cpal::SampleFormat::U16 => build::<u16>(&device, &config, frames),
                other => {
                    let _ = ready_tx.send(Err(MediaError::Platform(format!(
                        "unsupported sample format {:?}",
                        other
                    ))));
                    return;
                }
            };
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::Busy(format!("{}: {}", name, e))));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(MediaError::Platform(e.to_string())));
                return;
            }
            tracing::info!("Audio input device: {}", name);
            let _ = ready_tx.send(Ok(name));
            // Blocks until the sender is dropped.
            let _ = keep_rx.recv();
            drop(stream);
            tracing::debug!("Audio capture thread exited");
        });

        let name = ready_rx
            .recv()
            .map_err(|_| MediaError::Platform("audio thread died".into()))??;
        Ok(LocalTrack::new(TrackKind::Audio, name.clone(), name)
            .with_stop_hook(move || drop(keep_tx)))
    }
}

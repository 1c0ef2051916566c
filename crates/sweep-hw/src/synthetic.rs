//! Synthetic camera backend for tests and offline runs.
//!
//! Emits uniform gray frames on a fixed cadence. Open failures, silent
//! streams, frame limits and open latency are configurable, and the backend
//! keeps probes on every track it handed out so callers can check that
//! teardown really stopped them.

use crate::camera::{CameraBackend, CameraDevice, CameraError, Facing, Resolution, TrackState, VideoStream};
use crate::frame::Frame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What `open` does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open succeeds and frames flow.
    Stream,
    PermissionDenied,
    Unavailable,
    /// Open succeeds but no frame ever arrives.
    Silent,
}

#[derive(Debug)]
struct Inner {
    devices: Vec<CameraDevice>,
    behavior: OpenBehavior,
    frame_interval: Duration,
    open_delay: Duration,
    max_frames: Option<u32>,
    brightness: u8,
    open_calls: AtomicUsize,
    tracks: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Cheap to clone; clones share counters and track probes.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    inner: Arc<Inner>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SyntheticBackend {
    pub fn builder() -> SyntheticBuilder {
        SyntheticBuilder::default()
    }

    /// Number of `open` calls so far.
    pub fn open_calls(&self) -> usize {
        self.inner.open_calls.load(Ordering::SeqCst)
    }

    /// Tracks opened so far that have not been stopped.
    pub fn live_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| t.load(Ordering::SeqCst)).count()
    }

    pub fn opened_tracks(&self) -> usize {
        self.tracks().len()
    }

    fn tracks(&self) -> std::sync::MutexGuard<'_, Vec<Arc<AtomicBool>>> {
        // A poisoned probe list is still valid data.
        self.inner.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub struct SyntheticBuilder {
    devices: Vec<CameraDevice>,
    behavior: OpenBehavior,
    frame_interval: Duration,
    open_delay: Duration,
    max_frames: Option<u32>,
    brightness: u8,
}

impl Default for SyntheticBuilder {
    fn default() -> Self {
        Self {
            devices: vec![CameraDevice {
                id: "synthetic:0".into(),
                label: "Synthetic Front Camera".into(),
                facing: Facing::Front,
            }],
            behavior: OpenBehavior::Stream,
            frame_interval: Duration::from_millis(33),
            open_delay: Duration::ZERO,
            max_frames: None,
            brightness: 128,
        }
    }
}

impl SyntheticBuilder {
    pub fn devices(mut self, devices: Vec<CameraDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn behavior(mut self, behavior: OpenBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Delay before `open` resolves.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Stop producing frames after `n`; the stream then stays open but idle.
    pub fn max_frames(mut self, n: u32) -> Self {
        self.max_frames = Some(n);
        self
    }

    pub fn brightness(mut self, value: u8) -> Self {
        self.brightness = value;
        self
    }

    pub fn build(self) -> SyntheticBackend {
        SyntheticBackend {
            inner: Arc::new(Inner {
                devices: self.devices,
                behavior: self.behavior,
                frame_interval: self.frame_interval,
                open_delay: self.open_delay,
                max_frames: self.max_frames,
                brightness: self.brightness,
                open_calls: AtomicUsize::new(0),
                tracks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl CameraBackend for SyntheticBackend {
    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CameraError> {
        Ok(self.inner.devices.clone())
    }

    async fn open(
        &self,
        device: &CameraDevice,
        resolution: Resolution,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        self.inner.open_calls.fetch_add(1, Ordering::SeqCst);
        if !self.inner.open_delay.is_zero() {
            tokio::time::sleep(self.inner.open_delay).await;
        }

        match self.inner.behavior {
            OpenBehavior::PermissionDenied => {
                return Err(CameraError::PermissionDenied(format!("{} denied", device.id)));
            }
            OpenBehavior::Unavailable => {
                return Err(CameraError::DeviceUnavailable(format!("{} in use", device.id)));
            }
            OpenBehavior::Stream | OpenBehavior::Silent => {}
        }

        let live = Arc::new(AtomicBool::new(true));
        self.tracks().push(Arc::clone(&live));

        let limit = match self.inner.behavior {
            OpenBehavior::Silent => Some(0),
            _ => self.inner.max_frames,
        };

        Ok(Box::new(SyntheticStream {
            resolution,
            interval: self.inner.frame_interval,
            brightness: self.inner.brightness,
            limit,
            sequence: 0,
            live,
        }))
    }
}

struct SyntheticStream {
    resolution: Resolution,
    interval: Duration,
    brightness: u8,
    limit: Option<u32>,
    sequence: u32,
    live: Arc<AtomicBool>,
}

#[async_trait]
impl VideoStream for SyntheticStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, CameraError>> {
        if !self.live.load(Ordering::SeqCst) {
            return None;
        }
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            std::future::pending::<()>().await;
        }

        tokio::time::sleep(self.interval).await;
        self.sequence += 1;
        Some(Ok(Frame::solid(
            self.resolution.width,
            self.resolution.height,
            self.brightness,
            tokio::time::Instant::now().into_std(),
            self.sequence,
        )))
    }

    fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn track_state(&self) -> TrackState {
        if self.live.load(Ordering::SeqCst) {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

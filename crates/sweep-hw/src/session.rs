//! Capture session controller.
//!
//! Owns the one live camera session and its recorder. Opening a session
//! spawns a pump task that publishes the latest decoded frame on a `watch`
//! channel; readers (the sampler, the recorder, still capture) only ever see
//! the newest frame. Every open gets a fresh [`SessionId`]. A close aimed at an
//! older id is a no-op, and an open that finishes after it was superseded
//! tears its own stream down instead of installing it.
//!
//! State: `Idle -> Opening -> Ready -> Recording -> Stopped`, and any state
//! returns to `Idle` on close or failure.

use crate::camera::{select_device, CameraBackend, CameraDevice, CameraError, Resolution, TrackState, VideoStream};
use crate::frame::Frame;
use crate::recorder::{
    self, EncoderProvider, FrameFeed, MjpegProvider, RecorderError, RecordingBudget, RecordingHandle,
    RecordingOutcome, RecordingProgress, StopReason, PREFERRED_FORMATS,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consecutive frame errors after which the pump gives up on a stream.
const MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 5;
/// How long a closing session waits for the backend to release the device.
const RELEASE_WAIT: Duration = Duration::from_millis(500);
const RELEASE_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("capture attempt was superseded")]
    Superseded,
    #[error("capture was cancelled")]
    Cancelled,
    #[error("no live capture session")]
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Opening,
    Ready,
    Recording,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub device: CameraDevice,
    pub started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub resolution: Resolution,
    /// Bound on the wait for the first decodable frame.
    pub ready_timeout: Duration,
    pub preferred_formats: Vec<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            ready_timeout: Duration::from_secs(3),
            preferred_formats: PREFERRED_FORMATS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct Live {
    info: SessionInfo,
    frames: FrameFeed,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    recording: Option<RecordingHandle>,
}

struct Inner {
    backend: Arc<dyn CameraBackend>,
    encoders: Arc<dyn EncoderProvider>,
    options: CaptureOptions,
    generation: AtomicU64,
    state: watch::Sender<SessionState>,
    live: Mutex<Option<Live>>,
}

/// Handle to the controller; clones share the same session slot.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    pub fn new(backend: Arc<dyn CameraBackend>, options: CaptureOptions) -> Self {
        Self::with_encoders(backend, Arc::new(MjpegProvider::default()), options)
    }

    pub fn with_encoders(
        backend: Arc<dyn CameraBackend>,
        encoders: Arc<dyn EncoderProvider>,
        options: CaptureOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                backend,
                encoders,
                options,
                generation: AtomicU64::new(0),
                state,
                live: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Enumerate cameras. An empty list is [`CameraError::NoDeviceFound`].
    pub async fn list_devices(&self) -> Result<Vec<CameraDevice>, SessionError> {
        let devices = self.inner.backend.enumerate().await?;
        if devices.is_empty() {
            return Err(CameraError::NoDeviceFound.into());
        }
        Ok(devices)
    }

    /// Enumerate, pick the preferred device and open it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SessionInfo, SessionError> {
        let id = self.begin().await;
        let result = async {
            let devices = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                devices = self.list_devices() => devices?,
            };
            if !self.is_current(id) {
                return Err(SessionError::Superseded);
            }
            let device = select_device(&devices).cloned().ok_or(CameraError::NoDeviceFound)?;
            tracing::debug!(device = %device.id, label = %device.label, "selected camera");
            self.try_open(id, device, cancel).await
        }
        .await;
        self.settle_failure(id, result)
    }

    /// Open `device`, replacing any live session.
    pub async fn open(&self, device: CameraDevice, cancel: &CancellationToken) -> Result<SessionInfo, SessionError> {
        let id = self.begin().await;
        let result = self.try_open(id, device, cancel).await;
        self.settle_failure(id, result)
    }

    /// Close session `id`. Idempotent; a stale id never touches a newer session.
    pub async fn close(&self, id: SessionId) {
        let live = {
            let mut slot = self.lock_live();
            if self.is_current(id) {
                // Also aborts an open of `id` still in flight.
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                self.inner.state.send_replace(SessionState::Idle);
            }
            match slot.as_ref() {
                Some(live) if live.info.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(live) = live {
            teardown(live).await;
        }
    }

    /// Unconditional teardown of whatever is live or opening.
    pub async fn shutdown(&self) {
        let live = {
            let mut slot = self.lock_live();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner.state.send_replace(SessionState::Idle);
            slot.take()
        };
        if let Some(live) = live {
            teardown(live).await;
        }
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.lock_live().as_ref().map(|l| l.info.clone())
    }

    /// Latest frame of session `id`.
    pub fn current_frame(&self, id: SessionId) -> Option<Arc<Frame>> {
        self.with_live(id, |live| live.frames.borrow().clone()).flatten()
    }

    /// Subscribe to the frames of session `id`.
    pub fn frames(&self, id: SessionId) -> Option<FrameFeed> {
        self.with_live(id, |live| live.frames.clone())
    }

    /// Start a bounded recording on session `id`. The recorder stops when
    /// `cancel` fires, when a budget is spent, or when the session closes.
    pub fn start_recording(
        &self,
        id: SessionId,
        budget: RecordingBudget,
        cancel: &CancellationToken,
    ) -> Result<watch::Receiver<RecordingProgress>, SessionError> {
        let preferences: Vec<&str> = self.inner.options.preferred_formats.iter().map(String::as_str).collect();

        let mut slot = self.lock_live();
        let live = slot
            .as_mut()
            .filter(|live| live.info.id == id && live.recording.is_none())
            .ok_or(SessionError::NotReady)?;

        let encoder = recorder::negotiate(self.inner.encoders.as_ref(), &preferences)?;
        let handle = RecordingHandle::start(encoder, live.frames.clone(), budget, cancel.child_token());
        let progress = handle.progress();
        live.recording = Some(handle);
        self.inner.state.send_replace(SessionState::Recording);
        Ok(progress)
    }

    /// Stop the recording of session `id` and collect what it captured.
    /// Always resolves; a session without a recording yields `NoData`.
    pub async fn stop_recording(&self, id: SessionId) -> RecordingOutcome {
        let handle = {
            let mut slot = self.lock_live();
            match slot.as_mut() {
                Some(live) if live.info.id == id => live.recording.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return RecordingOutcome::NoData {
                reason: StopReason::Requested,
            };
        };

        let outcome = handle.finish().await;
        if self.is_current(id) {
            self.inner.state.send_replace(SessionState::Stopped);
        }
        outcome
    }

    fn lock_live(&self) -> MutexGuard<'_, Option<Live>> {
        // The slot holds plain data; a panic elsewhere does not corrupt it.
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_live<T>(&self, id: SessionId, f: impl FnOnce(&Live) -> T) -> Option<T> {
        self.lock_live().as_ref().filter(|live| live.info.id == id).map(f)
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == id.0
    }

    /// Reserve a new session id and drop whatever was live before.
    async fn begin(&self) -> SessionId {
        let (id, previous) = {
            let mut slot = self.lock_live();
            let id = SessionId(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);
            self.inner.state.send_replace(SessionState::Opening);
            (id, slot.take())
        };
        if let Some(previous) = previous {
            tracing::debug!(session = ?previous.info.id, "replacing live session");
            teardown(previous).await;
        }
        id
    }

    fn settle_failure(
        &self,
        id: SessionId,
        result: Result<SessionInfo, SessionError>,
    ) -> Result<SessionInfo, SessionError> {
        if let Err(e) = &result {
            if self.is_current(id) {
                self.inner.state.send_replace(SessionState::Idle);
            }
            tracing::warn!(session = ?id, error = %e, "camera acquisition failed");
        }
        result
    }

    async fn try_open(
        &self,
        id: SessionId,
        device: CameraDevice,
        cancel: &CancellationToken,
    ) -> Result<SessionInfo, SessionError> {
        let resolution = self.inner.options.resolution;
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            stream = self.inner.backend.open(&device, resolution) => stream?,
        };
        if !self.is_current(id) {
            stream.stop();
            return Err(SessionError::Superseded);
        }

        let (frame_tx, mut frames) = watch::channel(None);
        let pump_cancel = cancel.child_token();
        let pump = tokio::spawn(pump(stream, frame_tx, pump_cancel.clone(), device.id.clone()));

        let timeout = self.inner.options.ready_timeout;
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            arrived = tokio::time::timeout(timeout, first_frame(&mut frames)) => match arrived {
                Ok(true) => Ok(()),
                Ok(false) => Err(CameraError::CaptureFailed("stream ended before the first frame".into()).into()),
                Err(_) => Err(CameraError::StreamTimeout(timeout).into()),
            },
        };

        let info = SessionInfo {
            id,
            device,
            started_at: tokio::time::Instant::now().into_std(),
        };
        let live = Live {
            info: info.clone(),
            frames,
            cancel: pump_cancel,
            pump,
            recording: None,
        };

        if let Err(e) = ready {
            teardown(live).await;
            return Err(e);
        }

        let rejected = {
            let mut slot = self.lock_live();
            if self.is_current(id) {
                *slot = Some(live);
                self.inner.state.send_replace(SessionState::Ready);
                None
            } else {
                Some(live)
            }
        };
        if let Some(live) = rejected {
            teardown(live).await;
            return Err(SessionError::Superseded);
        }

        tracing::info!(session = ?info.id, device = %info.device.id, "camera ready");
        Ok(info)
    }
}

async fn first_frame(frames: &mut FrameFeed) -> bool {
    frames.wait_for(Option::is_some).await.is_ok()
}

/// Stop the recorder, then the pump; the pump stops the track on exit.
async fn teardown(live: Live) {
    live.cancel.cancel();
    if let Some(recording) = live.recording {
        let outcome = recording.finish().await;
        tracing::debug!(?outcome, "recording discarded on close");
    }
    if let Err(e) = live.pump.await {
        tracing::warn!(error = %e, "frame pump task failed");
    }
    tracing::info!(session = ?live.info.id, device = %live.info.device.id, "camera closed");
}

async fn pump(
    mut stream: Box<dyn VideoStream>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    cancel: CancellationToken,
    device: String,
) {
    let mut errors = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next_frame() => match next {
                Some(Ok(frame)) => {
                    errors = 0;
                    frames.send_replace(Some(Arc::new(frame)));
                }
                Some(Err(e)) => {
                    errors += 1;
                    tracing::warn!(device = %device, error = %e, errors, "frame capture failed");
                    if errors >= MAX_CONSECUTIVE_FRAME_ERRORS {
                        break;
                    }
                }
                None => {
                    tracing::debug!(device = %device, "stream ended");
                    break;
                }
            },
        }
    }
    stream.stop();
    wait_released(stream.as_mut(), &device).await;
}

/// Hold the close until the track reports `Ended`, so a reopen does not find
/// the device still busy.
async fn wait_released(stream: &mut dyn VideoStream, device: &str) {
    let deadline = tokio::time::Instant::now() + RELEASE_WAIT;
    while stream.track_state() != TrackState::Ended {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(device = %device, "camera still held after stop");
            return;
        }
        tokio::time::sleep(RELEASE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ChunkEncoder;
    use crate::synthetic::{OpenBehavior, SyntheticBackend};

    fn controller(backend: &SyntheticBackend) -> CaptureController {
        let options = CaptureOptions {
            resolution: Resolution::new(16, 12),
            ..CaptureOptions::default()
        };
        CaptureController::new(Arc::new(backend.clone()), options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_no_devices() {
        let backend = SyntheticBackend::builder().devices(Vec::new()).build();
        let ctl = controller(&backend);

        let err = ctl.acquire(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SessionError::Camera(CameraError::NoDeviceFound));
        assert_eq!(backend.open_calls(), 0);
        assert_eq!(ctl.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_first_frame() {
        let backend = SyntheticBackend::default();
        let ctl = controller(&backend);

        let info = ctl.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(ctl.state(), SessionState::Ready);
        assert_eq!(info.device.id, "synthetic:0");
        let frame = ctl.current_frame(info.id).unwrap();
        assert_eq!((frame.width, frame.height), (16, 12));
        assert_eq!(backend.live_tracks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_leaves_nothing_attached() {
        let backend = SyntheticBackend::builder()
            .behavior(OpenBehavior::PermissionDenied)
            .build();
        let ctl = controller(&backend);

        let err = ctl.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::Camera(CameraError::PermissionDenied(_))));
        assert_eq!(ctl.state(), SessionState::Idle);
        assert!(ctl.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let backend = SyntheticBackend::builder().behavior(OpenBehavior::Silent).build();
        let ctl = controller(&backend);

        let started = tokio::time::Instant::now();
        let err = ctl.acquire(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SessionError::Camera(CameraError::StreamTimeout(Duration::from_secs(3))));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(ctl.state(), SessionState::Idle);
        assert_eq!(backend.opened_tracks(), 1);
        assert_eq!(backend.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_open() {
        let backend = SyntheticBackend::builder()
            .open_delay(Duration::from_secs(1))
            .build();
        let ctl = controller(&backend);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = ctl.acquire(&cancel).await.unwrap_err();
        assert_eq!(err, SessionError::Cancelled);
        assert_eq!(ctl.state(), SessionState::Idle);
        assert_eq!(backend.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let backend = SyntheticBackend::default();
        let ctl = controller(&backend);
        let info = ctl.acquire(&CancellationToken::new()).await.unwrap();

        ctl.close(info.id).await;
        ctl.close(info.id).await;
        ctl.shutdown().await;

        assert_eq!(ctl.state(), SessionState::Idle);
        assert_eq!(backend.live_tracks(), 0);
        assert!(ctl.current_frame(info.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_close_spares_new_session() {
        let backend = SyntheticBackend::default();
        let ctl = controller(&backend);
        let first = ctl.acquire(&CancellationToken::new()).await.unwrap();
        let second = ctl.acquire(&CancellationToken::new()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(backend.live_tracks(), 1);

        ctl.close(first.id).await;

        assert_eq!(ctl.state(), SessionState::Ready);
        assert!(ctl.current_frame(second.id).is_some());
        assert_eq!(backend.live_tracks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_supersedes_open_in_flight() {
        let backend = SyntheticBackend::builder()
            .open_delay(Duration::from_millis(200))
            .build();
        let ctl = controller(&backend);

        let opener = ctl.clone();
        let attempt = tokio::spawn(async move { opener.acquire(&CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctl.shutdown().await;

        let result = attempt.await.unwrap();
        assert_eq!(result.unwrap_err(), SessionError::Superseded);
        assert_eq!(ctl.state(), SessionState::Idle);
        assert!(ctl.session().is_none());
        assert_eq!(backend.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_recording_and_tracks() {
        let backend = SyntheticBackend::default();
        let ctl = controller(&backend);
        let cancel = CancellationToken::new();
        let info = ctl.acquire(&cancel).await.unwrap();

        let progress = ctl
            .start_recording(info.id, RecordingBudget::default(), &cancel)
            .unwrap();
        assert_eq!(ctl.state(), SessionState::Recording);
        tokio::time::sleep(Duration::from_secs(1)).await;

        ctl.close(info.id).await;

        assert_eq!(progress.borrow().stopped, Some(StopReason::Requested));
        assert_eq!(backend.live_tracks(), 0);
        assert_eq!(ctl.state(), SessionState::Idle);

        // Nothing from the closed session runs any more.
        let before = progress.borrow().clone();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*progress.borrow(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_recording_without_frames_reports_no_data() {
        // One frame to become ready, then silence.
        let backend = SyntheticBackend::builder().max_frames(1).build();
        let ctl = controller(&backend);
        let cancel = CancellationToken::new();
        let info = ctl.acquire(&cancel).await.unwrap();

        ctl.start_recording(info.id, RecordingBudget::default(), &cancel)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let outcome = ctl.stop_recording(info.id).await;
        assert_eq!(
            outcome,
            RecordingOutcome::NoData {
                reason: StopReason::Requested
            }
        );
        assert_eq!(ctl.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_recording_returns_video() {
        let backend = SyntheticBackend::default();
        let ctl = controller(&backend);
        let cancel = CancellationToken::new();
        let info = ctl.acquire(&cancel).await.unwrap();

        ctl.start_recording(info.id, RecordingBudget::default(), &cancel)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let video = ctl.stop_recording(info.id).await.into_video().unwrap();
        assert_eq!(video.mime_type, recorder::MJPEG_MIME);
        assert!(video.size() > 0);
        // Camera stays up for the still capture.
        assert!(ctl.current_frame(info.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_unsupported() {
        struct NoEncoders;
        impl EncoderProvider for NoEncoders {
            fn create(&self, _: &str) -> Option<Box<dyn ChunkEncoder>> {
                None
            }
        }

        let backend = SyntheticBackend::default();
        let ctl = CaptureController::with_encoders(
            Arc::new(backend.clone()),
            Arc::new(NoEncoders),
            CaptureOptions::default(),
        );
        let cancel = CancellationToken::new();
        let info = ctl.acquire(&cancel).await.unwrap();

        let err = ctl
            .start_recording(info.id, RecordingBudget::default(), &cancel)
            .unwrap_err();
        assert_eq!(err, SessionError::Recorder(RecorderError::Unsupported));
        assert_eq!(ctl.state(), SessionState::Ready);
    }

    /// Device that lets go of the camera `linger` after its track is stopped.
    struct LingeringBackend {
        linger: Duration,
    }

    struct LingeringStream {
        linger: Duration,
        stopped_at: Option<tokio::time::Instant>,
        sequence: u32,
    }

    #[async_trait::async_trait]
    impl CameraBackend for LingeringBackend {
        async fn enumerate(&self) -> Result<Vec<CameraDevice>, CameraError> {
            Ok(vec![CameraDevice {
                id: "lingering:0".into(),
                label: "Lingering camera".into(),
                facing: crate::camera::Facing::Front,
            }])
        }

        async fn open(&self, _device: &CameraDevice, _resolution: Resolution) -> Result<Box<dyn VideoStream>, CameraError> {
            Ok(Box::new(LingeringStream {
                linger: self.linger,
                stopped_at: None,
                sequence: 0,
            }))
        }
    }

    #[async_trait::async_trait]
    impl VideoStream for LingeringStream {
        async fn next_frame(&mut self) -> Option<Result<Frame, CameraError>> {
            if self.stopped_at.is_some() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.sequence += 1;
            Some(Ok(Frame::solid(4, 4, 90, tokio::time::Instant::now().into_std(), self.sequence)))
        }

        fn stop(&mut self) {
            self.stopped_at.get_or_insert_with(tokio::time::Instant::now);
        }

        fn track_state(&self) -> TrackState {
            match self.stopped_at {
                Some(at) if at.elapsed() >= self.linger => TrackState::Ended,
                _ => TrackState::Live,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_device_release() {
        let ctl = CaptureController::new(
            Arc::new(LingeringBackend {
                linger: Duration::from_millis(120),
            }),
            CaptureOptions::default(),
        );
        let info = ctl.acquire(&CancellationToken::new()).await.unwrap();

        let start = tokio::time::Instant::now();
        ctl.close(info.id).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(120), "waited {waited:?}");
        assert!(waited < RELEASE_WAIT, "waited {waited:?}");
        assert_eq!(ctl.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_a_stuck_device() {
        let ctl = CaptureController::new(
            Arc::new(LingeringBackend {
                linger: Duration::from_secs(60),
            }),
            CaptureOptions::default(),
        );
        let info = ctl.acquire(&CancellationToken::new()).await.unwrap();

        let start = tokio::time::Instant::now();
        ctl.close(info.id).await;
        assert!(start.elapsed() >= RELEASE_WAIT);
        assert!(start.elapsed() < RELEASE_WAIT + Duration::from_millis(50));
    }
}

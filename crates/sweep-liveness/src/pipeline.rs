//! The host-facing capture pipeline.
//!
//! One [`LivenessCapture`] drives one attempt at a time:
//!
//! 1. acquire the camera and start a bounded recording;
//! 2. run the sampler, the countdown and the recorder watch as one timer group
//!    until the sweep completes, the ceiling is reached, or the recorder stops
//!    on a budget;
//! 3. stop the group, collect the video, let the user settle, take the still;
//! 4. close the camera, keep the artifact, hand the still to the registry.
//!
//! Every attempt owns a cancellation token. [`LivenessCapture::cancel`] cancels
//! it, waits for the timer group to exit and releases the camera; any
//! continuation of the cancelled attempt then finds its token cancelled and
//! leaves shared state alone.

use crate::artifact::{CaptureSuccess, CapturedArtifact};
use crate::config::Config;
use crate::error::PipelineError;
use crate::progress::{PipelineEvent, Progress, Stage};
use crate::registry::FaceRegistry;
use crate::sampler::{self, SamplerContext, SharedDetector, Trigger};
use crate::timers::{AttemptTimers, TimerKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use sweep_core::{Calibration, FaceDetector, LivenessState};
use sweep_hw::{CaptureController, RecordingOutcome, SessionInfo, StopReason};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;
const SETTLE_INSTRUCTION: &str = "Look straight at the camera";

/// Callbacks supplied by the host at construction.
pub trait HostCallbacks: Send + Sync {
    fn on_success(&self, success: &CaptureSuccess);
    fn on_error(&self, error: &PipelineError);
    /// The capture was closed by [`LivenessCapture::cancel`].
    fn on_close(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl HostCallbacks for NoopCallbacks {
    fn on_success(&self, _success: &CaptureSuccess) {}
    fn on_error(&self, _error: &PipelineError) {}
}

/// Identity of the attempt a continuation belongs to.
struct Ticket {
    id: u64,
    token: CancellationToken,
}

struct Attempt {
    id: u64,
    token: CancellationToken,
    timers: Option<AttemptTimers>,
}

pub struct LivenessCapture {
    controller: CaptureController,
    detector: SharedDetector,
    registry: Arc<dyn FaceRegistry>,
    callbacks: Arc<dyn HostCallbacks>,
    calibration: Arc<Calibration>,
    config: Config,
    user_id: String,
    progress: Arc<watch::Sender<Progress>>,
    events: broadcast::Sender<PipelineEvent>,
    attempts: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    artifact: Mutex<Option<Arc<CapturedArtifact>>>,
}

pub struct LivenessCaptureBuilder {
    controller: CaptureController,
    detector: Box<dyn FaceDetector>,
    registry: Arc<dyn FaceRegistry>,
    callbacks: Arc<dyn HostCallbacks>,
    calibration: Calibration,
    config: Config,
    user_id: String,
}

impl LivenessCaptureBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn HostCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn build(self) -> LivenessCapture {
        let (progress, _) = watch::channel(Progress::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        LivenessCapture {
            controller: self.controller,
            detector: sampler::shared_detector(self.detector),
            registry: self.registry,
            callbacks: self.callbacks,
            calibration: Arc::new(self.calibration),
            config: self.config,
            user_id: self.user_id,
            progress: Arc::new(progress),
            events,
            attempts: AtomicU64::new(0),
            attempt: Mutex::new(None),
            artifact: Mutex::new(None),
        }
    }
}

impl LivenessCapture {
    pub fn builder(
        controller: CaptureController,
        detector: Box<dyn FaceDetector>,
        registry: Arc<dyn FaceRegistry>,
    ) -> LivenessCaptureBuilder {
        LivenessCaptureBuilder {
            controller,
            detector,
            registry,
            callbacks: Arc::new(NoopCallbacks),
            calibration: Calibration::default(),
            config: Config::default(),
            user_id: String::new(),
        }
    }

    /// Run a full attempt: record, verify, capture, register.
    pub async fn run(&self) -> Result<CaptureSuccess, PipelineError> {
        let ticket = self.begin_attempt(true);
        let artifact = match self.capture(&ticket).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(&ticket, e)),
        };
        self.register(&ticket, artifact).await
    }

    /// Start over: new camera session, cleared segments, prior artifact dropped.
    pub async fn retry(&self) -> Result<CaptureSuccess, PipelineError> {
        tracing::info!("retrying capture from the start");
        self.run().await
    }

    /// Register the retained artifact again without recording.
    pub async fn retry_registration(&self) -> Result<CaptureSuccess, PipelineError> {
        let artifact = self
            .artifact()
            .ok_or(PipelineError::NotReady("No captured photo to register. Start a new capture."))?;
        tracing::info!(artifact = %artifact.id, "retrying registration");
        let ticket = self.begin_attempt(false);
        self.register(&ticket, artifact).await
    }

    /// Tear everything down. Safe from any state and safe to repeat.
    pub async fn cancel(&self) {
        let attempt = self.lock_attempt().take();
        if let Some(mut attempt) = attempt {
            attempt.token.cancel();
            if let Some(timers) = attempt.timers.take() {
                timers.shutdown().await;
            }
            tracing::debug!(attempt = attempt.id, "attempt cancelled");
        }
        self.controller.shutdown().await;

        let closed = self.progress.send_if_modified(|p| {
            if p.stage == Stage::Closed {
                return false;
            }
            p.stage = Stage::Closed;
            true
        });
        if closed {
            tracing::info!("capture closed");
            self.callbacks.on_close();
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Artifact of the last attempt that got as far as the still capture.
    pub fn artifact(&self) -> Option<Arc<CapturedArtifact>> {
        self.lock_artifact().clone()
    }

    pub fn controller(&self) -> &CaptureController {
        &self.controller
    }

    /// Camera through still capture. The camera is closed on every exit.
    async fn capture(&self, ticket: &Ticket) -> Result<Arc<CapturedArtifact>, PipelineError> {
        let info = self.controller.acquire(&ticket.token).await?;
        self.emit(
            ticket,
            PipelineEvent::CameraReady {
                device: info.device.label.clone(),
            },
        );
        let result = self.record(ticket, &info).await;
        self.controller.close(info.id).await;
        result
    }

    async fn record(&self, ticket: &Ticket, info: &SessionInfo) -> Result<Arc<CapturedArtifact>, PipelineError> {
        let (trigger_tx, mut triggers) = mpsc::channel(4);
        let mut timers = AttemptTimers::new(&ticket.token);
        let recording = self
            .controller
            .start_recording(info.id, self.config.recording, timers.token())?;

        timers.spawn(
            TimerKind::Sampler,
            sampler::sample(SamplerContext {
                controller: self.controller.clone(),
                session: info.id,
                detector: Arc::clone(&self.detector),
                calibration: Arc::clone(&self.calibration),
                interval: self.config.sample_interval,
                min_confidence: self.config.min_detection_confidence,
                face_absent_timeout: self.config.face_absent_timeout,
                progress: Arc::clone(&self.progress),
                events: self.events.clone(),
                triggers: trigger_tx.clone(),
            }),
        );
        timers.spawn(
            TimerKind::Countdown,
            sampler::countdown(self.config.attempt_ceiling(), Arc::clone(&self.progress), trigger_tx.clone()),
        );
        timers.spawn(
            TimerKind::Recorder,
            sampler::watch_recording(recording, Arc::clone(&self.progress), trigger_tx),
        );
        self.install_timers(ticket, timers)?;
        self.update(ticket, |p| p.stage = Stage::Recording);
        self.emit(ticket, PipelineEvent::RecordingStarted);

        let trigger = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Err(PipelineError::Cancelled),
            trigger = triggers.recv() => trigger,
        };

        let timers = self.take_timers(ticket).ok_or(PipelineError::Cancelled)?;
        timers.shutdown().await;

        let outcome = self.controller.stop_recording(info.id).await;
        let (reason, bytes) = match &outcome {
            RecordingOutcome::Recorded(video) => (video.stop_reason, video.size() as u64),
            RecordingOutcome::NoData { reason } => (*reason, 0),
            RecordingOutcome::Failed(_) => (StopReason::EncoderFailed, 0),
        };
        self.emit(ticket, PipelineEvent::RecordingStopped { reason, bytes });
        let video = match outcome {
            RecordingOutcome::Failed(message) => return Err(PipelineError::Recording(message)),
            other => other.into_video(),
        };

        match trigger {
            Some(Trigger::RecordingStopped(StopReason::StreamEnded)) | None => {
                return Err(PipelineError::Capture("the camera stopped delivering frames".into()));
            }
            Some(trigger) => tracing::info!(?trigger, "recording phase finished"),
        }

        self.update(ticket, |p| {
            p.stage = Stage::Settling;
            p.instruction = SETTLE_INSTRUCTION;
        });
        tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.config.settle) => {}
        }

        self.update(ticket, |p| p.stage = Stage::Capturing);
        let frame = self
            .controller
            .current_frame(info.id)
            .ok_or_else(|| PipelineError::Capture("no camera frame available".into()))?;
        if frame.is_dark() {
            tracing::warn!(brightness = frame.avg_brightness(), "still frame is very dark");
        }
        let quality = self.config.still_jpeg_quality;
        let encoding = Arc::clone(&frame);
        let still = tokio::task::spawn_blocking(move || encoding.encode_jpeg(quality))
            .await
            .map_err(|e| PipelineError::Capture(e.to_string()))?
            .map_err(|e| PipelineError::Capture(e.to_string()))?;
        self.emit(
            ticket,
            PipelineEvent::StillCaptured {
                width: frame.width,
                height: frame.height,
                bytes: still.len(),
            },
        );

        let completed = self.progress.borrow().completed;
        let artifact = Arc::new(CapturedArtifact::new(still, frame.width, frame.height, video, completed));
        if ticket.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        *self.lock_artifact() = Some(Arc::clone(&artifact));
        tracing::info!(
            artifact = %artifact.id,
            completed,
            still_bytes = artifact.still_jpeg.len(),
            video_bytes = artifact.video.as_ref().map_or(0, |v| v.size()),
            "capture finalized"
        );
        Ok(artifact)
    }

    async fn register(&self, ticket: &Ticket, artifact: Arc<CapturedArtifact>) -> Result<CaptureSuccess, PipelineError> {
        self.update(ticket, |p| p.stage = Stage::Registering);
        let face_id = match self.index(ticket, &artifact).await {
            Ok(face_id) => face_id,
            Err(e) => return Err(self.fail(ticket, e)),
        };
        if ticket.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let success = CaptureSuccess {
            reference_image: artifact.data_url(),
            video: artifact.video.clone(),
            confidence: artifact.confidence(),
            face_id: face_id.clone(),
            artifact_id: artifact.id,
        };
        self.update(ticket, |p| p.stage = Stage::Succeeded);
        self.emit(ticket, PipelineEvent::Registered { face_id });
        tracing::info!(artifact = %artifact.id, face_id = %success.face_id, confidence = success.confidence, "face registered");
        self.callbacks.on_success(&success);
        self.end_attempt(ticket);
        Ok(success)
    }

    async fn index(&self, ticket: &Ticket, artifact: &CapturedArtifact) -> Result<String, PipelineError> {
        if self.user_id.trim().is_empty() {
            return Err(PipelineError::Registration("user id not available".into()));
        }
        let response = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Err(PipelineError::Cancelled),
            response = self.registry.index_face(&artifact.still_jpeg, &self.user_id) => response,
        };
        match response {
            Ok(r) if r.success => Ok(r.face_id.unwrap_or_default()),
            Ok(r) => Err(PipelineError::Registration(
                r.error.unwrap_or_else(|| "the face was not accepted".into()),
            )),
            Err(e) => Err(PipelineError::Registration(e.to_string())),
        }
    }

    /// Report `error` for the attempt, unless the attempt was cancelled.
    fn fail(&self, ticket: &Ticket, error: PipelineError) -> PipelineError {
        if error == PipelineError::Cancelled || ticket.token.is_cancelled() {
            tracing::debug!(attempt = ticket.id, "attempt ended by cancellation");
            return PipelineError::Cancelled;
        }

        let message = error.to_string();
        tracing::warn!(attempt = ticket.id, kind = ?error.kind(), error = %message, "capture attempt failed");
        self.update(ticket, |p| p.stage = Stage::Failed);
        let event = if error.is_registration() {
            PipelineEvent::RegistrationFailed { message }
        } else {
            PipelineEvent::Failed { message }
        };
        self.emit(ticket, event);
        self.callbacks.on_error(&error);
        self.end_attempt(ticket);
        error
    }

    /// Supersede whatever attempt is active and open a new one. A full
    /// attempt also drops the previous artifact and resets the snapshot.
    fn begin_attempt(&self, full: bool) -> Ticket {
        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = self.lock_attempt().replace(Attempt {
            id,
            token: token.clone(),
            timers: None,
        });
        if let Some(previous) = previous {
            tracing::debug!(attempt = previous.id, "superseding attempt");
            previous.token.cancel();
        }

        if full {
            *self.lock_artifact() = None;
            let state = LivenessState::new(tokio::time::Instant::now().into_std());
            self.progress.send_replace(Progress::attempt(
                &self.calibration.plan,
                &state,
                self.config.attempt_ceiling(),
            ));
        }
        tracing::info!(attempt = id, full, "capture attempt started");
        Ticket { id, token }
    }

    fn end_attempt(&self, ticket: &Ticket) {
        let mut slot = self.lock_attempt();
        if slot.as_ref().is_some_and(|a| a.id == ticket.id) {
            slot.take();
        }
    }

    fn install_timers(&self, ticket: &Ticket, timers: AttemptTimers) -> Result<(), PipelineError> {
        let mut slot = self.lock_attempt();
        match slot.as_mut() {
            Some(attempt) if attempt.id == ticket.id && !ticket.token.is_cancelled() => {
                attempt.timers = Some(timers);
                Ok(())
            }
            // Dropping the group cancels it.
            _ => Err(PipelineError::Cancelled),
        }
    }

    fn take_timers(&self, ticket: &Ticket) -> Option<AttemptTimers> {
        let mut slot = self.lock_attempt();
        slot.as_mut().filter(|a| a.id == ticket.id).and_then(|a| a.timers.take())
    }

    /// Mutate the snapshot while `ticket` is still live.
    fn update(&self, ticket: &Ticket, f: impl FnOnce(&mut Progress)) {
        self.progress.send_if_modified(|p| {
            if ticket.token.is_cancelled() {
                return false;
            }
            f(p);
            true
        });
    }

    fn emit(&self, ticket: &Ticket, event: PipelineEvent) {
        if !ticket.token.is_cancelled() {
            let _ = self.events.send(event);
        }
    }

    fn lock_attempt(&self) -> MutexGuard<'_, Option<Attempt>> {
        self.attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_artifact(&self) -> MutexGuard<'_, Option<Arc<CapturedArtifact>>> {
        self.artifact.lock().unwrap_or_else(|e| e.into_inner())
    }
}

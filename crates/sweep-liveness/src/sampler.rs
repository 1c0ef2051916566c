//! Timer tasks of a recording attempt: the detection tick, the countdown and
//! the recorder watch. Each reports to the pipeline through a [`Trigger`].

use crate::progress::{PipelineEvent, Progress};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::{Calibration, FaceDetector, FaceObservation, GrayImage, LivenessState};
use sweep_hw::{CaptureController, Frame, RecordingProgress, SessionId, StopReason};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;

/// Why the recording phase of an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// All eight segments were completed.
    Verified,
    /// The countdown reached zero.
    CeilingReached,
    /// The recorder stopped on its own.
    RecordingStopped(StopReason),
}

/// Detector shared across attempts. The lock is held for the whole
/// inference, so a held lock means a detection is still in flight.
pub(crate) type SharedDetector = Arc<Mutex<Box<dyn FaceDetector>>>;

pub(crate) fn shared_detector(detector: Box<dyn FaceDetector>) -> SharedDetector {
    Arc::new(Mutex::new(detector))
}

/// Result of one detection tick.
enum Detection {
    Face(FaceObservation),
    NoFace,
    /// A detection started by an earlier attempt has not returned yet.
    Busy,
}

pub(crate) struct SamplerContext {
    pub controller: CaptureController,
    pub session: SessionId,
    pub detector: SharedDetector,
    pub calibration: Arc<Calibration>,
    pub interval: Duration,
    pub min_confidence: f32,
    pub face_absent_timeout: Duration,
    pub progress: Arc<watch::Sender<Progress>>,
    pub events: broadcast::Sender<PipelineEvent>,
    pub triggers: mpsc::Sender<Trigger>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Detection tick. Inference runs on the blocking pool and the loop waits for
/// it, so a tick that overruns its period makes the next one skip and ticks
/// never queue up behind a slow detector.
pub(crate) async fn sample(ctx: SamplerContext) {
    let plan = &ctx.calibration.plan;
    let mut state = LivenessState::new(now());
    let mut interval = tokio::time::interval(ctx.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(frame) = ctx.controller.current_frame(ctx.session) else {
            tracing::debug!(session = ?ctx.session, "session closed, sampler stopping");
            break;
        };

        let observation = match detect(&ctx, frame).await {
            Detection::Face(observation) => Some(observation),
            Detection::NoFace => None,
            Detection::Busy => {
                tracing::trace!("detector busy, tick skipped");
                continue;
            }
        };
        let Some(observation) = observation else {
            let was_present = state.face_present();
            let gap = state.record_miss(now(), ctx.face_absent_timeout);
            if was_present && !state.face_present() {
                let absent_ms = gap.as_millis() as u64;
                tracing::debug!(absent_ms, "face lost");
                let _ = ctx.events.send(PipelineEvent::FaceLost { absent_ms });
            }
            ctx.progress.send_modify(|p| p.apply(plan, &state));
            continue;
        };

        if !state.face_present() {
            let _ = ctx.events.send(PipelineEvent::FaceObserved {
                confidence: observation.confidence,
            });
        }
        state.record_detection(now());

        // A face without landmarks counts for presence but never for pose.
        let Some(landmarks) = observation.landmarks.as_ref() else {
            tracing::trace!(confidence = observation.confidence, "face without landmarks");
            ctx.progress.send_modify(|p| p.apply(plan, &state));
            continue;
        };

        let estimate = sweep_core::estimate(landmarks, state.last_pose(), &ctx.calibration.pose);
        let step = state.advance(plan, &estimate);
        tracing::trace!(
            yaw = estimate.yaw(),
            pitch = estimate.pitch(),
            degenerate = estimate.degenerate,
            next = state.next_index(),
            "pose sample"
        );

        let _ = ctx.events.send(PipelineEvent::Pose {
            yaw: estimate.yaw(),
            pitch: estimate.pitch(),
            hint: step.hint,
        });
        if let Some(index) = step.completed {
            if let Some(target) = plan.get(index) {
                tracing::info!(index, direction = ?target.direction, "segment completed");
                let _ = ctx.events.send(PipelineEvent::SegmentCompleted {
                    index,
                    direction: target.direction,
                });
            }
        }
        ctx.progress.send_modify(|p| {
            p.apply(plan, &state);
            p.hint = step.hint;
        });

        if step.verification_complete {
            tracing::info!("verification complete");
            let _ = ctx.events.send(PipelineEvent::VerificationComplete);
            let _ = ctx.triggers.send(Trigger::Verified).await;
            break;
        }
    }
}

/// Best face in `frame`, found off the async runtime. Detector faults are
/// logged and count as no face.
async fn detect(ctx: &SamplerContext, frame: Arc<Frame>) -> Detection {
    let Ok(mut detector) = Arc::clone(&ctx.detector).try_lock_owned() else {
        return Detection::Busy;
    };
    let min_confidence = ctx.min_confidence;

    let job = tokio::task::spawn_blocking(move || {
        let luma = frame.luma();
        let image = GrayImage {
            data: &luma,
            width: frame.width,
            height: frame.height,
            captured_at: frame.timestamp,
        };
        match detector.detect(&image, min_confidence) {
            Ok(faces) => faces
                .into_iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .map_or(Detection::NoFace, Detection::Face),
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "face detection failed");
                Detection::NoFace
            }
        }
    });
    match job.await {
        Ok(detection) => detection,
        Err(e) => {
            tracing::warn!(error = %e, "detection task failed");
            Detection::NoFace
        }
    }
}

/// Once-per-second countdown of the attempt ceiling.
pub(crate) async fn countdown(
    ceiling: Duration,
    progress: Arc<watch::Sender<Progress>>,
    triggers: mpsc::Sender<Trigger>,
) {
    let second = Duration::from_secs(1);
    let mut remaining = ceiling.as_secs();
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + second, second);

    while remaining > 0 {
        ticks.tick().await;
        remaining -= 1;
        progress.send_modify(|p| p.remaining_secs = remaining);
    }
    tracing::info!(ceiling_secs = ceiling.as_secs(), "attempt ceiling reached");
    let _ = triggers.send(Trigger::CeilingReached).await;
}

/// Mirror recorder progress into the snapshot and report a stop the pipeline
/// did not ask for.
pub(crate) async fn watch_recording(
    mut recording: watch::Receiver<RecordingProgress>,
    progress: Arc<watch::Sender<Progress>>,
    triggers: mpsc::Sender<Trigger>,
) {
    loop {
        let snapshot = recording.borrow_and_update().clone();
        progress.send_modify(|p| p.apply_recording(&snapshot));

        if let Some(reason) = snapshot.stopped {
            if reason != StopReason::Requested {
                tracing::info!(?reason, bytes = snapshot.bytes, "recording stopped");
                let _ = triggers.send(Trigger::RecordingStopped(reason)).await;
            }
            break;
        }
        if recording.changed().await.is_err() {
            break;
        }
    }
}

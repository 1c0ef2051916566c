//! End-to-end capture runs against the synthetic camera on a paused clock.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sweep_core::{
    BoundingBox, Calibration, DetectorError, FaceDetector, FaceObservation, GrayImage, LandmarkLayout, Landmarks,
    SEGMENT_COUNT,
};
use sweep_hw::{CameraError, CaptureController, CaptureOptions, Resolution, SessionError, SyntheticBackend};
use sweep_liveness::{
    CaptureSuccess, Config, ErrorKind, FaceRegistry, HostCallbacks, IndexFaceResponse, LivenessCapture,
    PipelineError, PipelineEvent, RegistryError, Stage,
};
use tokio::sync::broadcast;

/// Replays poses as 5-point faces, one per detection, then holds the last.
struct ScriptedDetector {
    poses: Vec<Option<(f32, f32)>>,
    calls: usize,
}

impl ScriptedDetector {
    fn new(poses: Vec<Option<(f32, f32)>>) -> Box<Self> {
        Box::new(Self { poses, calls: 0 })
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, image: &GrayImage<'_>, _min: f32) -> Result<Vec<FaceObservation>, DetectorError> {
        let index = self.calls.min(self.poses.len().saturating_sub(1));
        self.calls += 1;
        let Some(Some((yaw, pitch))) = self.poses.get(index).copied() else {
            return Ok(Vec::new());
        };
        let points = vec![
            (100.0, 100.0),
            (140.0, 100.0),
            (120.0 + yaw * 0.4, 100.0 + 40.0 * LandmarkLayout::Scrfd5.neutral_nose_drop() + pitch * 0.4),
            (105.0, 130.0),
            (135.0, 130.0),
        ];
        Ok(vec![FaceObservation {
            bbox: BoundingBox {
                x: 80.0,
                y: 60.0,
                width: 80.0,
                height: 100.0,
            },
            confidence: 0.8,
            landmarks: Some(Landmarks::new(LandmarkLayout::Scrfd5, points)),
            timestamp: image.captured_at,
        }])
    }
}

/// Each segment's centre held for four ticks, in order.
fn full_sweep() -> Vec<Option<(f32, f32)>> {
    let mut poses = Vec::new();
    for target in Calibration::default().plan.targets.iter() {
        let c = target.center();
        poses.extend(std::iter::repeat(Some((c.yaw, c.pitch))).take(4));
    }
    poses
}

#[derive(Default)]
struct ScriptedRegistry {
    replies: Mutex<VecDeque<IndexFaceResponse>>,
    calls: AtomicUsize,
}

impl ScriptedRegistry {
    fn replying(replies: Vec<IndexFaceResponse>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceRegistry for ScriptedRegistry {
    async fn index_face(&self, image: &[u8], user_id: &str) -> Result<IndexFaceResponse, RegistryError> {
        assert!(image.starts_with(&[0xFF, 0xD8]), "registry expects a JPEG");
        assert_eq!(user_id, "user-1");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| IndexFaceResponse::indexed("face-default")))
    }
}

#[derive(Default)]
struct RecordingCallbacks {
    successes: Mutex<Vec<CaptureSuccess>>,
    errors: Mutex<Vec<PipelineError>>,
    closes: AtomicUsize,
}

impl HostCallbacks for RecordingCallbacks {
    fn on_success(&self, success: &CaptureSuccess) {
        self.successes.lock().unwrap().push(success.clone());
    }

    fn on_error(&self, error: &PipelineError) {
        self.errors.lock().unwrap().push(error.clone());
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    capture: Arc<LivenessCapture>,
    backend: SyntheticBackend,
    registry: Arc<ScriptedRegistry>,
    callbacks: Arc<RecordingCallbacks>,
}

fn rig(backend: SyntheticBackend, poses: Vec<Option<(f32, f32)>>, registry: Arc<ScriptedRegistry>) -> Rig {
    let controller = CaptureController::new(
        Arc::new(backend.clone()),
        CaptureOptions {
            resolution: Resolution::new(32, 24),
            ..CaptureOptions::default()
        },
    );
    let mut config = Config::default();
    config.recording.max_duration = Duration::from_secs(10);
    config.settle = Duration::from_secs(1);

    let callbacks = Arc::new(RecordingCallbacks::default());
    let capture = LivenessCapture::builder(controller, ScriptedDetector::new(poses), registry.clone())
        .config(config)
        .callbacks(callbacks.clone())
        .user_id("user-1")
        .build();
    Rig {
        capture: Arc::new(capture),
        backend,
        registry,
        callbacks,
    }
}

fn camera() -> SyntheticBackend {
    SyntheticBackend::builder().frame_interval(Duration::from_millis(40)).build()
}

fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn full_sweep_registers_with_full_confidence() {
    let rig = rig(camera(), full_sweep(), ScriptedRegistry::replying(vec![IndexFaceResponse::indexed("face-42")]));
    let mut events = rig.capture.subscribe();

    let success = rig.capture.run().await.unwrap();
    assert_eq!(success.face_id, "face-42");
    assert_eq!(success.confidence, 100.0);
    assert!(success.reference_image.starts_with("data:image/jpeg;base64,"));
    assert!(success.video.as_ref().is_some_and(|v| v.size() > 0));

    let progress = rig.capture.progress();
    assert_eq!(progress.stage, Stage::Succeeded);
    assert_eq!(progress.completed, SEGMENT_COUNT);
    assert!(progress.segments.iter().all(|&done| done));

    let events = drain(&mut events);
    let completed: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::SegmentCompleted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(completed, (0..SEGMENT_COUNT).collect::<Vec<_>>());
    let verified = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::VerificationComplete))
        .count();
    assert_eq!(verified, 1);
    assert!(matches!(events.last(), Some(PipelineEvent::Registered { .. })));

    assert_eq!(rig.backend.live_tracks(), 0);
    assert_eq!(rig.callbacks.successes.lock().unwrap().len(), 1);
    assert!(rig.callbacks.errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn out_of_order_pose_never_advances() {
    let up_left = Calibration::default().plan.targets[3].center();
    let rig = rig(camera(), vec![Some((up_left.yaw, up_left.pitch))], ScriptedRegistry::replying(Vec::new()));
    let mut events = rig.capture.subscribe();

    // The ceiling ends the attempt; finalization still runs.
    let success = rig.capture.run().await.unwrap();
    assert_eq!(success.confidence, 0.0);
    assert_eq!(rig.capture.progress().completed, 0);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, PipelineEvent::SegmentCompleted { .. })));
    assert_eq!(rig.capture.artifact().unwrap().segments_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn no_camera_fails_acquisition_without_opening() {
    let backend = SyntheticBackend::builder().devices(Vec::new()).build();
    let rig = rig(backend, full_sweep(), ScriptedRegistry::replying(Vec::new()));

    let err = rig.capture.run().await.unwrap_err();
    assert_eq!(err, PipelineError::Acquisition(SessionError::Camera(CameraError::NoDeviceFound)));
    assert_eq!(err.kind(), Some(ErrorKind::Acquisition));
    assert_eq!(rig.backend.open_calls(), 0);
    assert_eq!(rig.capture.progress().stage, Stage::Failed);
    assert_eq!(rig.callbacks.errors.lock().unwrap().as_slice(), &[err]);
}

#[tokio::test(start_paused = true)]
async fn rejected_registration_keeps_artifact_for_retry() {
    let registry = ScriptedRegistry::replying(vec![
        IndexFaceResponse::rejected("x"),
        IndexFaceResponse::indexed("face-7"),
    ]);
    let rig = rig(camera(), full_sweep(), registry);

    let err = rig.capture.run().await.unwrap_err();
    assert!(err.is_registration());
    assert_eq!(err.to_string(), "Face registration failed: x");
    assert_eq!(rig.callbacks.errors.lock().unwrap().as_slice(), &[err]);
    let artifact = rig.capture.artifact().unwrap();
    assert_eq!(artifact.segments_completed, SEGMENT_COUNT);
    assert_eq!(rig.backend.live_tracks(), 0);

    let success = rig.capture.retry_registration().await.unwrap();
    assert_eq!(success.face_id, "face-7");
    assert_eq!(success.artifact_id, artifact.id);
    assert_eq!(rig.registry.calls(), 2);
    assert_eq!(rig.backend.open_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_retry_starts_from_scratch() {
    let registry = ScriptedRegistry::replying(vec![IndexFaceResponse::rejected("busy")]);
    let rig = rig(camera(), full_sweep(), registry);

    rig.capture.run().await.unwrap_err();
    let first = rig.capture.artifact().unwrap();

    // The detector now holds the last pose, so the new sweep cannot pass segment 0.
    let success = rig.capture.retry().await.unwrap();
    assert_eq!(rig.backend.open_calls(), 2);
    assert_ne!(success.artifact_id, first.id);
    assert_eq!(success.confidence, 0.0);
    assert_eq!(rig.capture.progress().completed, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_recording_releases_everything() {
    let rig = rig(camera(), vec![Some((0.0, 0.0))], ScriptedRegistry::replying(Vec::new()));
    let runner = {
        let capture = Arc::clone(&rig.capture);
        tokio::spawn(async move { capture.run().await })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.capture.progress().stage, Stage::Recording);
    assert_eq!(rig.backend.live_tracks(), 1);

    rig.capture.cancel().await;
    assert_eq!(runner.await.unwrap(), Err(PipelineError::Cancelled));
    assert_eq!(rig.backend.live_tracks(), 0);

    let frozen = rig.capture.progress();
    assert_eq!(frozen.stage, Stage::Closed);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(rig.capture.progress(), frozen);

    rig.capture.cancel().await;
    assert_eq!(rig.callbacks.closes.load(Ordering::SeqCst), 1);
    assert!(rig.callbacks.errors.lock().unwrap().is_empty());
    assert_eq!(rig.registry.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn superseded_attempt_leaves_the_new_one_alone() {
    let registry = ScriptedRegistry::replying(vec![IndexFaceResponse::indexed("face-2")]);
    let rig = rig(camera(), vec![Some((0.0, 0.0))], registry);
    let mut events = rig.capture.subscribe();

    let first = {
        let capture = Arc::clone(&rig.capture);
        tokio::spawn(async move { capture.run().await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.capture.progress().stage, Stage::Recording);
    drain(&mut events);

    let second = {
        let capture = Arc::clone(&rig.capture);
        tokio::spawn(async move { capture.run().await })
    };
    assert_eq!(first.await.unwrap(), Err(PipelineError::Cancelled));

    let success = second.await.unwrap().unwrap();
    assert_eq!(success.face_id, "face-2");
    assert_eq!(rig.capture.progress().stage, Stage::Succeeded);
    assert_eq!(rig.capture.artifact().unwrap().id, success.artifact_id);

    let events = drain(&mut events);
    let count = |wanted: fn(&PipelineEvent) -> bool| events.iter().filter(|e| wanted(e)).count();
    assert_eq!(count(|e| matches!(e, PipelineEvent::CameraReady { .. })), 1);
    assert_eq!(count(|e| matches!(e, PipelineEvent::RecordingStarted)), 1);
    assert_eq!(count(|e| matches!(e, PipelineEvent::Registered { .. })), 1);
    assert_eq!(
        count(|e| matches!(e, PipelineEvent::Failed { .. } | PipelineEvent::RegistrationFailed { .. })),
        0
    );

    assert_eq!(rig.callbacks.successes.lock().unwrap().len(), 1);
    assert!(rig.callbacks.errors.lock().unwrap().is_empty());
    assert_eq!(rig.callbacks.closes.load(Ordering::SeqCst), 0);
    assert_eq!(rig.registry.calls(), 1);
    assert_eq!(rig.backend.open_calls(), 2);
    assert_eq!(rig.backend.live_tracks(), 0);
}

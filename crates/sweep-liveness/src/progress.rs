//! Observable pipeline state.
//!
//! [`Progress`] is the latest snapshot, published on a `watch` channel so a
//! presentation layer can redraw from it at any rate. [`PipelineEvent`] is the
//! discrete stream (segment completions, face lost, registration outcome) for
//! feedback that must fire once per occurrence.

use serde::Serialize;
use std::time::Duration;
use sweep_core::{AxisMatch, Direction, LivenessState, PoseSample, SegmentPlan, SEGMENT_COUNT};
use sweep_hw::{RecordingProgress, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Initializing,
    Recording,
    Settling,
    Capturing,
    Registering,
    Succeeded,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub completed: usize,
    pub segments: [bool; SEGMENT_COUNT],
    pub next_direction: Option<Direction>,
    pub instruction: &'static str,
    pub face_present: bool,
    pub pose: PoseSample,
    /// Axes of the pending target matched by the last pose.
    pub hint: Option<AxisMatch>,
    pub remaining_secs: u64,
    pub recording_ms: u64,
    pub recording_bytes: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            completed: 0,
            segments: [false; SEGMENT_COUNT],
            next_direction: None,
            instruction: "",
            face_present: false,
            pose: PoseSample::default(),
            hint: None,
            remaining_secs: 0,
            recording_ms: 0,
            recording_bytes: 0,
        }
    }
}

impl Progress {
    /// Fresh snapshot for a new recording attempt.
    pub fn attempt(plan: &SegmentPlan, state: &LivenessState, ceiling: Duration) -> Self {
        let mut progress = Self {
            stage: Stage::Initializing,
            remaining_secs: ceiling.as_secs(),
            ..Self::default()
        };
        progress.apply(plan, state);
        progress
    }

    /// Copy the state machine's view into the snapshot.
    pub fn apply(&mut self, plan: &SegmentPlan, state: &LivenessState) {
        self.completed = state.completed_count();
        self.segments = *state.segments();
        self.next_direction = plan.get(state.next_index()).map(|t| t.direction);
        self.instruction = state.instruction(plan);
        self.face_present = state.face_present();
        self.pose = state.last_pose();
    }

    pub fn apply_recording(&mut self, recording: &RecordingProgress) {
        self.recording_ms = recording.elapsed.as_millis() as u64;
        self.recording_bytes = recording.bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CameraReady { device: String },
    RecordingStarted,
    FaceObserved { confidence: f32 },
    FaceLost { absent_ms: u64 },
    Pose { yaw: f32, pitch: f32, hint: Option<AxisMatch> },
    SegmentCompleted { index: usize, direction: Direction },
    VerificationComplete,
    RecordingStopped { reason: StopReason, bytes: u64 },
    StillCaptured { width: u32, height: u32, bytes: usize },
    Registered { face_id: String },
    RegistrationFailed { message: String },
    Failed { message: String },
}

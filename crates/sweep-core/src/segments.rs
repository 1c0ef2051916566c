//! Sequential head-sweep liveness check.
//!
//! The user must point their head through eight angular windows in a fixed
//! order (right, up-right, up, up-left, left, down-left, down, down-right).
//! [`LivenessState`] tracks which windows have been hit; it has no timers of its
//! own and only moves forward when [`LivenessState::advance`] is fed a pose that
//! lands inside the pending window.

use crate::pose::{PoseEstimate, PoseSample};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Number of directional segments in a sweep.
pub const SEGMENT_COUNT: usize = 8;

/// Direction of one sweep segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Right,
    UpRight,
    Up,
    UpLeft,
    Left,
    DownLeft,
    Down,
    DownRight,
}

impl Direction {
    /// Prompt shown to the user while this segment is pending.
    pub fn instruction(self) -> &'static str {
        match self {
            Direction::Right => "Slowly turn head right",
            Direction::UpRight => "Look up and right",
            Direction::Up => "Look straight up",
            Direction::UpLeft => "Look up and left",
            Direction::Left => "Slowly turn head left",
            Direction::DownLeft => "Look down and left",
            Direction::Down => "Look straight down",
            Direction::DownRight => "Look down and right",
        }
    }
}

/// Inclusive `[min, max]` interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRange {
    pub min: f32,
    pub max: f32,
}

impl AngleRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn midpoint(&self) -> f32 {
        (self.min + self.max) / 2.0
    }
}

/// One angular window of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentTarget {
    pub direction: Direction,
    pub yaw: AngleRange,
    pub pitch: AngleRange,
}

impl SegmentTarget {
    pub fn matches(&self, pose: PoseSample) -> AxisMatch {
        AxisMatch {
            yaw: self.yaw.contains(pose.yaw),
            pitch: self.pitch.contains(pose.pitch),
        }
    }

    /// Pose at the centre of the window.
    pub fn center(&self) -> PoseSample {
        PoseSample::new(self.yaw.midpoint(), self.pitch.midpoint())
    }
}

const fn target(direction: Direction, yaw: (f32, f32), pitch: (f32, f32)) -> SegmentTarget {
    SegmentTarget {
        direction,
        yaw: AngleRange::new(yaw.0, yaw.1),
        pitch: AngleRange::new(pitch.0, pitch.1),
    }
}

/// Default windows. Negative pitch is up; positive yaw is toward the image right.
pub const DEFAULT_SEGMENTS: [SegmentTarget; SEGMENT_COUNT] = [
    target(Direction::Right, (10.0, 70.0), (-20.0, 20.0)),
    target(Direction::UpRight, (5.0, 60.0), (-60.0, -5.0)),
    target(Direction::Up, (-15.0, 15.0), (-60.0, -5.0)),
    target(Direction::UpLeft, (-60.0, -5.0), (-60.0, -5.0)),
    target(Direction::Left, (-70.0, -10.0), (-20.0, 20.0)),
    target(Direction::DownLeft, (-60.0, -5.0), (5.0, 60.0)),
    target(Direction::Down, (-15.0, 15.0), (5.0, 60.0)),
    target(Direction::DownRight, (5.0, 60.0), (5.0, 60.0)),
];

/// The ordered list of windows a sweep must visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub targets: [SegmentTarget; SEGMENT_COUNT],
}

impl Default for SegmentPlan {
    fn default() -> Self {
        Self {
            targets: DEFAULT_SEGMENTS,
        }
    }
}

impl SegmentPlan {
    pub fn get(&self, index: usize) -> Option<&SegmentTarget> {
        self.targets.get(index)
    }
}

/// Which axes of the pending window the latest pose fell inside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMatch {
    pub yaw: bool,
    pub pitch: bool,
}

impl AxisMatch {
    pub fn both(&self) -> bool {
        self.yaw && self.pitch
    }
}

/// What one call to [`LivenessState::advance`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Step {
    /// Axis match against the segment that was pending; `None` once complete.
    pub hint: Option<AxisMatch>,
    /// Index of the segment completed by this call.
    pub completed: Option<usize>,
    /// Set on the single call that completed the final segment.
    pub verification_complete: bool,
}

/// Mutable state of one recording attempt.
#[derive(Debug, Clone)]
pub struct LivenessState {
    segments: [bool; SEGMENT_COUNT],
    next_index: usize,
    last_pose: PoseSample,
    last_detection: Instant,
    face_present: bool,
}

impl LivenessState {
    pub fn new(now: Instant) -> Self {
        Self {
            segments: [false; SEGMENT_COUNT],
            next_index: 0,
            last_pose: PoseSample::default(),
            last_detection: now,
            face_present: false,
        }
    }

    /// Feed one pose estimate. Only the pending segment can be satisfied.
    pub fn advance(&mut self, plan: &SegmentPlan, estimate: &PoseEstimate) -> Step {
        if !estimate.degenerate {
            self.last_pose = estimate.smoothed;
        }

        let Some(target) = plan.get(self.next_index) else {
            return Step::default();
        };

        let hint = target.matches(estimate.smoothed);
        let mut step = Step {
            hint: Some(hint),
            ..Step::default()
        };

        if hint.both() {
            let index = self.next_index;
            self.segments[index] = true;
            self.next_index += 1;
            step.completed = Some(index);
            step.verification_complete = self.next_index == SEGMENT_COUNT;
            tracing::debug!(
                index,
                direction = ?target.direction,
                yaw = estimate.smoothed.yaw,
                pitch = estimate.smoothed.pitch,
                "segment completed"
            );
        }

        step
    }

    /// Note a frame in which a face was found.
    pub fn record_detection(&mut self, at: Instant) {
        self.last_detection = at;
        self.face_present = true;
    }

    /// Note a frame with no face. Presence drops once the gap exceeds
    /// `absence_timeout`. Returns the time since the last detection.
    pub fn record_miss(&mut self, at: Instant, absence_timeout: Duration) -> Duration {
        let gap = at.saturating_duration_since(self.last_detection);
        if gap > absence_timeout {
            self.face_present = false;
        }
        gap
    }

    pub fn segments(&self) -> &[bool; SEGMENT_COUNT] {
        &self.segments
    }

    /// Index of the next required segment (`SEGMENT_COUNT` once complete).
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn completed_count(&self) -> usize {
        self.next_index
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= SEGMENT_COUNT
    }

    pub fn last_pose(&self) -> PoseSample {
        self.last_pose
    }

    pub fn face_present(&self) -> bool {
        self.face_present
    }

    /// Prompt for the pending segment.
    pub fn instruction(&self, plan: &SegmentPlan) -> &'static str {
        match plan.get(self.next_index) {
            Some(target) => target.direction.instruction(),
            None => "Processing...",
        }
    }
}

//! Approximate head orientation from 2D facial landmarks.
//!
//! Yaw and pitch are the offsets of the nose tip from the midpoint between the
//! eyes, normalized by the inter-eye distance and scaled by a fixed gain. Pitch
//! is measured from where a frontal face of the same layout puts its nose (see
//! [`crate::types::LandmarkLayout::neutral_nose_drop`]). The result is not an
//! angle in the geometric sense; it is a bounded score that the segment windows
//! in [`crate::segments`] are calibrated against.
//!
//! Estimation never fails. Incomplete or degenerate landmark sets produce the
//! neutral estimate so the sampling loop can keep running.

use crate::types::Landmarks;
use serde::{Deserialize, Serialize};

/// Tunable constants of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseCalibration {
    /// Multiplier applied to the normalized nose offset.
    pub gain: f32,
    /// Raw yaw/pitch are clamped to `[-clamp, clamp]`.
    pub clamp: f32,
    /// Weight of the new raw sample in the exponential smoother.
    pub alpha: f32,
    /// Subtracted from raw pitch before clamping, on top of the layout's own
    /// neutral correction. Per-camera tuning.
    pub pitch_offset: f32,
    /// Inter-eye distances below this (in pixels) are treated as degenerate.
    pub min_eye_distance: f32,
}

impl Default for PoseCalibration {
    fn default() -> Self {
        Self {
            gain: 100.0,
            clamp: 100.0,
            alpha: 0.8,
            pitch_offset: 0.0,
            min_eye_distance: 0.01,
        }
    }
}

/// A yaw/pitch pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub yaw: f32,
    pub pitch: f32,
}

impl PoseSample {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }
}

/// Output of one estimation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    /// Clamped, unsmoothed value for this frame.
    pub raw: PoseSample,
    /// Value after blending with the previous smoothed pose.
    pub smoothed: PoseSample,
    /// True when the landmarks could not be used and the neutral pose was returned.
    pub degenerate: bool,
}

impl PoseEstimate {
    pub fn neutral() -> Self {
        Self {
            raw: PoseSample::default(),
            smoothed: PoseSample::default(),
            degenerate: true,
        }
    }

    /// Smoothed yaw, the value segment matching uses.
    pub fn yaw(&self) -> f32 {
        self.smoothed.yaw
    }

    /// Smoothed pitch, the value segment matching uses.
    pub fn pitch(&self) -> f32 {
        self.smoothed.pitch
    }
}

/// Estimate head pose from landmarks, smoothing against `previous`.
pub fn estimate(
    landmarks: &Landmarks,
    previous: PoseSample,
    calibration: &PoseCalibration,
) -> PoseEstimate {
    let Some(raw) = raw_pose(landmarks, calibration) else {
        tracing::trace!(
            points = landmarks.points.len(),
            layout = ?landmarks.layout,
            "degenerate landmarks, using neutral pose"
        );
        return PoseEstimate::neutral();
    };

    let alpha = calibration.alpha.clamp(0.0, 1.0);
    let smoothed = PoseSample {
        yaw: alpha * raw.yaw + (1.0 - alpha) * previous.yaw,
        pitch: alpha * raw.pitch + (1.0 - alpha) * previous.pitch,
    };

    PoseEstimate {
        raw,
        smoothed,
        degenerate: false,
    }
}

/// Clamped raw yaw/pitch, or `None` for unusable geometry.
fn raw_pose(landmarks: &Landmarks, calibration: &PoseCalibration) -> Option<PoseSample> {
    if !landmarks.is_complete() {
        return None;
    }
    let points = &landmarks.points;
    let regions = landmarks.layout.pose_regions();

    let left_eye = centroid(&points[regions.left_eye])?;
    let right_eye = centroid(&points[regions.right_eye])?;
    let nose = &points[regions.nose];
    let nose_tip = nose
        .last()
        .or_else(|| nose.get(regions.nose_tip_fallback))
        .copied()?;

    let center = (
        (left_eye.0 + right_eye.0) / 2.0,
        (left_eye.1 + right_eye.1) / 2.0,
    );
    let eye_distance = ((right_eye.0 - left_eye.0).powi(2) + (right_eye.1 - left_eye.1).powi(2)).sqrt();
    if !eye_distance.is_finite() || eye_distance < calibration.min_eye_distance {
        return None;
    }

    let yaw = (nose_tip.0 - center.0) / eye_distance * calibration.gain;
    let nose_drop = (nose_tip.1 - center.1) / eye_distance - landmarks.layout.neutral_nose_drop();
    let pitch = nose_drop * calibration.gain - calibration.pitch_offset;
    if !yaw.is_finite() || !pitch.is_finite() {
        return None;
    }

    let limit = calibration.clamp.abs();
    Some(PoseSample {
        yaw: yaw.clamp(-limit, limit),
        pitch: pitch.clamp(-limit, limit),
    })
}

fn centroid(points: &[(f32, f32)]) -> Option<(f32, f32)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
    Some((sx / n, sy / n))
}

//! sweep-core — Head pose estimation and the segment sweep liveness check.
//!
//! Pure, synchronous building blocks: landmark types, the pose estimator,
//! the eight-segment state machine, calibration data, and the face detector
//! seam with an SCRFD implementation on ONNX Runtime.

pub mod calibration;
pub mod detector;
pub mod pose;
pub mod segments;
pub mod types;

pub use calibration::{Calibration, CalibrationError};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use pose::{estimate, PoseCalibration, PoseEstimate, PoseSample};
pub use segments::{
    AngleRange, AxisMatch, Direction, LivenessState, SegmentPlan, SegmentTarget, Step, SEGMENT_COUNT,
};
pub use types::{BoundingBox, FaceObservation, GrayImage, LandmarkLayout, Landmarks};

//! sweep-hw — Camera capture, session lifecycle and bounded recording.
//!
//! Provides the camera backend seam (V4L2 and a synthetic backend for tests),
//! the capture session controller that owns the one live stream, and the
//! budgeted recorder that runs alongside it.

pub mod camera;
pub mod frame;
pub mod recorder;
pub mod session;
pub mod synthetic;
pub mod v4l2;

pub use camera::{select_device, CameraBackend, CameraDevice, CameraError, Facing, Resolution, TrackState, VideoStream};
pub use frame::{Frame, FrameError, PixelLayout};
pub use recorder::{
    RecorderError, RecordingBudget, RecordingOutcome, RecordingProgress, StopReason, VideoBlob,
};
pub use session::{CaptureController, CaptureOptions, SessionError, SessionId, SessionInfo, SessionState};
pub use synthetic::SyntheticBackend;
pub use v4l2::V4l2Backend;

use serde::Serialize;
use sweep_hw::{CameraError, SessionError};
use thiserror::Error;

/// Failure classes reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// No camera, permission denied, or the stream never became ready.
    Acquisition,
    /// Recorder unsupported or failed mid-attempt.
    Recording,
    /// The still frame could not be taken or encoded.
    Capture,
    /// The liveness check passed but the registry refused or failed.
    Registration,
}

/// Errors surfaced by the capture pipeline. `Display` is the user-facing text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("{}", acquisition_message(.0))]
    Acquisition(SessionError),
    #[error("Recording failed: {0}")]
    Recording(String),
    #[error("Could not capture a photo: {0}")]
    Capture(String),
    #[error("Face registration failed: {0}")]
    Registration(String),
    #[error("Capture was cancelled")]
    Cancelled,
    #[error("{0}")]
    NotReady(&'static str),
}

impl PipelineError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::Acquisition(_) => Some(ErrorKind::Acquisition),
            PipelineError::Recording(_) => Some(ErrorKind::Recording),
            PipelineError::Capture(_) => Some(ErrorKind::Capture),
            PipelineError::Registration(_) => Some(ErrorKind::Registration),
            PipelineError::Cancelled | PipelineError::NotReady(_) => None,
        }
    }

    /// Only registration failed; the captured artifact is still usable.
    pub fn is_registration(&self) -> bool {
        matches!(self, PipelineError::Registration(_))
    }
}

impl From<SessionError> for PipelineError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Cancelled | SessionError::Superseded => PipelineError::Cancelled,
            SessionError::Recorder(e) => PipelineError::Recording(e.to_string()),
            other => PipelineError::Acquisition(other),
        }
    }
}

fn acquisition_message(e: &SessionError) -> String {
    match e {
        SessionError::Camera(CameraError::NoDeviceFound) => "No camera found. Connect a camera and try again.".into(),
        SessionError::Camera(CameraError::PermissionDenied(_)) => {
            "Camera access was denied. Allow camera access and try again.".into()
        }
        SessionError::Camera(CameraError::DeviceUnavailable(_)) => {
            "The camera is in use or unavailable. Close other camera apps and try again.".into()
        }
        SessionError::Camera(CameraError::StreamTimeout(_)) => {
            "The camera did not start in time. Please try again.".into()
        }
        other => format!("Could not start the camera: {other}"),
    }
}

//! Camera backends: device discovery and live video streams.

use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("no camera found")]
    NoDeviceFound,
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera produced no frame within {}ms", .0.as_millis())]
    StreamTimeout(Duration),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
}

/// Which way a camera points, when the platform says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
    Unknown,
}

/// A camera the backend can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
    pub facing: Facing,
}

impl CameraDevice {
    fn looks_front_facing(&self) -> bool {
        let label = self.label.to_lowercase();
        label.contains("front") || label.contains("facing")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

/// State of the media track behind a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// Platform camera access.
#[async_trait]
pub trait CameraBackend: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CameraError>;

    /// Request a video-only stream at (or near) `resolution`.
    async fn open(
        &self,
        device: &CameraDevice,
        resolution: Resolution,
    ) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// A live stream of decoded frames.
#[async_trait]
pub trait VideoStream: Send {
    /// Next frame. `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, CameraError>>;

    /// Ask the underlying track to stop. Idempotent.
    fn stop(&mut self);

    /// `Ended` once the device behind the track is released. A backend may
    /// still report `Live` for a short while after [`VideoStream::stop`].
    fn track_state(&self) -> TrackState;
}

/// Prefer a front-facing camera, then one whose label says so, then the first.
pub fn select_device(devices: &[CameraDevice]) -> Option<&CameraDevice> {
    devices
        .iter()
        .find(|d| d.facing == Facing::Front)
        .or_else(|| devices.iter().find(|d| d.looks_front_facing()))
        .or_else(|| devices.first())
}

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sweep_core::SEGMENT_COUNT;
use sweep_hw::VideoBlob;
use uuid::Uuid;

/// What one finished attempt produced: the still, and the video when the
/// recorder captured any.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedArtifact {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub still_jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub video: Option<VideoBlob>,
    pub segments_completed: usize,
}

impl CapturedArtifact {
    pub fn new(still_jpeg: Vec<u8>, width: u32, height: u32, video: Option<VideoBlob>, segments_completed: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            still_jpeg,
            width,
            height,
            video,
            segments_completed,
        }
    }

    /// The still as a `data:image/jpeg;base64,` URL.
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", STANDARD.encode(&self.still_jpeg))
    }

    /// Share of the sweep completed, 0 to 100.
    pub fn confidence(&self) -> f32 {
        100.0 * self.segments_completed.min(SEGMENT_COUNT) as f32 / SEGMENT_COUNT as f32
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.id,
            captured_at: self.captured_at,
            width: self.width,
            height: self.height,
            still_bytes: self.still_jpeg.len(),
            video_bytes: self.video.as_ref().map(VideoBlob::size),
            video_ms: self.video.as_ref().map(|v| v.duration.as_millis() as u64),
            segments_completed: self.segments_completed,
        }
    }
}

/// Metadata of an artifact, without the payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactSummary {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub still_bytes: usize,
    pub video_bytes: Option<usize>,
    pub video_ms: Option<u64>,
    pub segments_completed: usize,
}

/// Payload handed to the host on success.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSuccess {
    /// Still image as a data URL.
    pub reference_image: String,
    pub video: Option<VideoBlob>,
    pub confidence: f32,
    pub face_id: String,
    pub artifact_id: Uuid,
}

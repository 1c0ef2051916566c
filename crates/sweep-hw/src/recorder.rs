//! Bounded media recording.
//!
//! A recording encodes every new frame published by the session pump,
//! groups the encoded bytes into chunks once per timeslice, and stops on its
//! own when either the duration or the size budget is spent. Progress
//! (elapsed time, accumulated bytes) is observable through a `watch` channel.

use crate::frame::Frame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Container formats tried in order when a recording starts.
pub const PREFERRED_FORMATS: &[&str] = &[
    "video/webm;codecs=vp9",
    "video/webm;codecs=vp8",
    "video/webm",
    "video/mp4",
    MJPEG_MIME,
];

pub const MJPEG_MIME: &str = "video/x-motion-jpeg";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("no supported recording format available")]
    Unsupported,
    #[error("encoder failed: {0}")]
    Encoder(String),
}

/// Limits of one recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingBudget {
    pub max_duration: Duration,
    pub max_bytes: u64,
    /// Interval at which encoded data is emitted as a chunk.
    pub timeslice: Duration,
}

impl Default for RecordingBudget {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30),
            max_bytes: (9.5 * 1024.0 * 1024.0) as u64,
            timeslice: Duration::from_millis(500),
        }
    }
}

/// Why a recording stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    DurationBudget,
    SizeBudget,
    StreamEnded,
    EncoderFailed,
}

impl StopReason {
    /// Stopped on its own rather than at the caller's request.
    pub fn is_automatic(self) -> bool {
        matches!(self, StopReason::DurationBudget | StopReason::SizeBudget)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingProgress {
    pub elapsed: Duration,
    pub bytes: u64,
    pub chunks: usize,
    /// Set once the recorder has stopped.
    pub stopped: Option<StopReason>,
}

/// Encodes frames into container bytes.
pub trait ChunkEncoder: Send {
    fn mime_type(&self) -> &str;
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, RecorderError>;
}

/// Supplies encoders by MIME type.
pub trait EncoderProvider: Send + Sync {
    fn create(&self, mime_type: &str) -> Option<Box<dyn ChunkEncoder>>;
}

/// Pick the first format in `preferences` the provider can encode.
pub fn negotiate(
    provider: &dyn EncoderProvider,
    preferences: &[&str],
) -> Result<Box<dyn ChunkEncoder>, RecorderError> {
    for mime in preferences {
        if let Some(encoder) = provider.create(mime) {
            tracing::debug!(mime = %mime, "recording format selected");
            return Ok(encoder);
        }
    }
    Err(RecorderError::Unsupported)
}

/// Motion-JPEG: every frame is a standalone JPEG, concatenated.
#[derive(Debug, Clone, Copy)]
pub struct MjpegEncoder {
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl ChunkEncoder for MjpegEncoder {
    fn mime_type(&self) -> &str {
        MJPEG_MIME
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, RecorderError> {
        frame
            .encode_jpeg(self.quality)
            .map_err(|e| RecorderError::Encoder(e.to_string()))
    }
}

/// Built-in provider: Motion-JPEG only.
#[derive(Debug, Clone, Copy)]
pub struct MjpegProvider {
    pub quality: u8,
}

impl Default for MjpegProvider {
    fn default() -> Self {
        Self { quality: 70 }
    }
}

impl EncoderProvider for MjpegProvider {
    fn create(&self, mime_type: &str) -> Option<Box<dyn ChunkEncoder>> {
        (mime_type == MJPEG_MIME).then(|| Box::new(MjpegEncoder::new(self.quality)) as Box<dyn ChunkEncoder>)
    }
}

/// Encoded video handed back by a finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoBlob {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub duration: Duration,
    pub chunks: usize,
    pub stop_reason: StopReason,
}

impl VideoBlob {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Result of stopping a recording. Stopping never fails; problems are outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingOutcome {
    Recorded(VideoBlob),
    /// The recorder ran but captured nothing.
    NoData { reason: StopReason },
    /// Recording was abandoned; partial data was discarded.
    Failed(String),
}

impl RecordingOutcome {
    pub fn video(&self) -> Option<&VideoBlob> {
        match self {
            RecordingOutcome::Recorded(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn into_video(self) -> Option<VideoBlob> {
        match self {
            RecordingOutcome::Recorded(blob) => Some(blob),
            _ => None,
        }
    }
}

/// Frame source a recorder consumes: the session pump's latest frame.
pub type FrameFeed = watch::Receiver<Option<Arc<Frame>>>;

/// A running recorder task.
#[derive(Debug)]
pub struct RecordingHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<RecordingProgress>,
    task: JoinHandle<RecordingOutcome>,
}

impl RecordingHandle {
    /// Spawn a recorder. Cancelling `cancel` stops it with [`StopReason::Requested`].
    pub fn start(
        encoder: Box<dyn ChunkEncoder>,
        frames: FrameFeed,
        budget: RecordingBudget,
        cancel: CancellationToken,
    ) -> Self {
        let (progress_tx, progress) = watch::channel(RecordingProgress::default());
        let task = tokio::spawn(record(encoder, frames, budget, cancel.clone(), progress_tx));
        Self {
            cancel,
            progress,
            task,
        }
    }

    pub fn progress(&self) -> watch::Receiver<RecordingProgress> {
        self.progress.clone()
    }

    /// Stop (if still running) and collect the outcome.
    pub async fn finish(self) -> RecordingOutcome {
        self.cancel.cancel();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RecordingOutcome::Failed(format!("recorder task failed: {e}")),
        }
    }
}

async fn record(
    mut encoder: Box<dyn ChunkEncoder>,
    mut frames: FrameFeed,
    budget: RecordingBudget,
    cancel: CancellationToken,
    progress: watch::Sender<RecordingProgress>,
) -> RecordingOutcome {
    let mime_type = encoder.mime_type().to_string();
    let start = Instant::now();
    let deadline = tokio::time::sleep_until(start + budget.max_duration);
    tokio::pin!(deadline);

    let timeslice = budget.timeslice.max(Duration::from_millis(1));
    let mut slices = tokio::time::interval_at(start + timeslice, timeslice);
    slices.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Only frames published after the start are recorded.
    frames.borrow_and_update();

    let mut pending: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut chunks = 0usize;
    let mut failure = None;

    tracing::info!(
        mime = %mime_type,
        max_secs = budget.max_duration.as_secs_f32(),
        max_bytes = budget.max_bytes,
        "recording started"
    );

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Requested,
            _ = &mut deadline => break StopReason::DurationBudget,
            _ = slices.tick() => {
                if !pending.is_empty() {
                    data.append(&mut pending);
                    chunks += 1;
                }
                let bytes = data.len() as u64;
                progress.send_modify(|p| {
                    p.elapsed = start.elapsed();
                    p.bytes = bytes;
                    p.chunks = chunks;
                });
                tracing::trace!(bytes, chunks, "recording chunk");
                if bytes >= budget.max_bytes {
                    break StopReason::SizeBudget;
                }
            }
            changed = frames.changed() => {
                if changed.is_err() {
                    break StopReason::StreamEnded;
                }
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    match encode_blocking(encoder, frame).await {
                        Ok((returned, bytes)) => {
                            encoder = returned;
                            pending.extend_from_slice(&bytes);
                        }
                        Err(e) => {
                            failure = Some(e.to_string());
                            break StopReason::EncoderFailed;
                        }
                    }
                }
            }
        }
    };

    let duration = start.elapsed();
    let outcome = if let Some(message) = failure {
        tracing::warn!(error = %message, "recording abandoned");
        RecordingOutcome::Failed(message)
    } else {
        if !pending.is_empty() {
            data.append(&mut pending);
            chunks += 1;
        }
        if data.is_empty() {
            RecordingOutcome::NoData { reason }
        } else {
            RecordingOutcome::Recorded(VideoBlob {
                mime_type,
                data,
                duration,
                chunks,
                stop_reason: reason,
            })
        }
    };

    let bytes = outcome.video().map_or(0, |v| v.size() as u64);
    progress.send_modify(|p| {
        p.elapsed = duration;
        p.bytes = bytes;
        p.chunks = chunks;
        p.stopped = Some(reason);
    });
    tracing::info!(?reason, bytes, secs = duration.as_secs_f32(), "recording stopped");

    outcome
}

/// Encode one frame on the blocking pool. The encoder is handed back with the
/// bytes so the recording keeps using it.
async fn encode_blocking(
    mut encoder: Box<dyn ChunkEncoder>,
    frame: Arc<Frame>,
) -> Result<(Box<dyn ChunkEncoder>, Vec<u8>), RecorderError> {
    tokio::task::spawn_blocking(move || {
        let bytes = encoder.encode(&frame)?;
        Ok((encoder, bytes))
    })
    .await
    .map_err(|e| RecorderError::Encoder(format!("encoder task failed: {e}")))?
}

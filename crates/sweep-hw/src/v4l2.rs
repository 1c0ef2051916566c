//! V4L2 camera backend via the `v4l` crate.
//!
//! Each open stream owns a capture thread that dequeues mmap buffers,
//! converts them, and hands frames to the async side over a bounded channel.
//! Frames are dropped rather than queued when the consumer falls behind.

use crate::camera::{CameraBackend, CameraDevice, CameraError, Facing, Resolution, TrackState, VideoStream};
use crate::frame::{self, Frame, PixelLayout};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MAX_DEVICES: usize = 16;
const MMAP_BUFFERS: u32 = 4;
const FRAME_CHANNEL_DEPTH: usize = 2;
const EBUSY: i32 = 16;

/// Pixel formats the backend can convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    /// Packed YUYV 4:2:2, converted to RGB.
    Yuyv,
    /// 8-bit grayscale, passed through.
    Grey,
}

impl SourceFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct V4l2Backend {
    /// Restrict enumeration to this device node.
    only: Option<String>,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that only ever offers `path` (e.g. `/dev/video2`).
    pub fn with_device(path: impl Into<String>) -> Self {
        Self {
            only: Some(path.into()),
        }
    }
}

#[async_trait]
impl CameraBackend for V4l2Backend {
    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CameraError> {
        let mut devices = tokio::task::spawn_blocking(scan_devices)
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("device scan panicked: {e}")))?;
        if let Some(only) = &self.only {
            devices.retain(|d| &d.id == only);
        }
        Ok(devices)
    }

    async fn open(
        &self,
        device: &CameraDevice,
        resolution: Resolution,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        let path = device.id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        let released = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_released = Released(Arc::clone(&released));
        std::thread::Builder::new()
            .name(format!("v4l2-capture:{path}"))
            .spawn(move || {
                let _released = thread_released;
                capture_thread(path, resolution, thread_stop, ready_tx, frame_tx);
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(V4l2Stream {
                frames: frame_rx,
                stop,
                released,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CameraError::CaptureFailed("capture thread exited during open".into())),
        }
    }
}

/// Probe `/dev/video0..15` for video capture nodes.
fn scan_devices() -> Vec<CameraDevice> {
    let mut devices = Vec::new();

    for i in 0..MAX_DEVICES {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        tracing::debug!(device = %path, card = %caps.card, driver = %caps.driver, "found capture device");
        devices.push(CameraDevice {
            id: path,
            label: caps.card.clone(),
            facing: Facing::Unknown,
        });
    }

    devices
}

fn map_open_error(path: &str, e: &io::Error) -> CameraError {
    let text = e.to_string();
    if e.kind() == io::ErrorKind::PermissionDenied {
        CameraError::PermissionDenied(format!("{path}: {e}"))
    } else if e.raw_os_error() == Some(EBUSY) || text.contains("busy") {
        CameraError::DeviceUnavailable(format!("{path} is busy"))
    } else {
        CameraError::DeviceUnavailable(format!("{path}: {e}"))
    }
}

/// Marks the device released when the capture thread exits, however it exits.
struct Released(Arc<AtomicBool>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Open, negotiate and stream on one thread so no v4l handle crosses threads.
fn capture_thread(
    path: String,
    resolution: Resolution,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), CameraError>>,
    frames: mpsc::Sender<Result<Frame, CameraError>>,
) {
    let device = match Device::with_path(&path) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(map_open_error(&path, &e)));
            return;
        }
    };

    let (width, height, format) = match negotiate(&device, resolution) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(map_open_error(&path, &e)));
            return;
        }
    };

    tracing::info!(device = %path, width, height, ?format, "camera stream started");
    if ready.send(Ok(())).is_err() {
        return;
    }

    while !stop.load(Ordering::Acquire) {
        let result = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))
            .and_then(|(buf, meta)| convert(buf, width, height, format, meta.sequence));

        let failed = result.is_err();
        match frames.try_send(result) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
        if failed {
            break;
        }
    }

    tracing::debug!(device = %path, "capture thread exiting");
}

fn negotiate(device: &Device, resolution: Resolution) -> Result<(u32, u32, SourceFormat), CameraError> {
    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::DeviceUnavailable(format!("{} cannot capture video", caps.card)));
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = resolution.width;
    fmt.height = resolution.height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let format = SourceFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {:?} (need YUYV or GREY)",
            negotiated.fourcc
        ))
    })?;

    Ok((negotiated.width, negotiated.height, format))
}

fn convert(buf: &[u8], width: u32, height: u32, format: SourceFormat, sequence: u32) -> Result<Frame, CameraError> {
    let (data, layout) = match format {
        SourceFormat::Yuyv => (frame::yuyv_to_rgb(buf, width, height), PixelLayout::Rgb8),
        SourceFormat::Grey => {
            let pixels = width as usize * height as usize;
            let data = buf
                .get(..pixels)
                .map(<[u8]>::to_vec)
                .ok_or(frame::FrameError::InvalidLength {
                    expected: pixels,
                    actual: buf.len(),
                });
            (data, PixelLayout::Gray8)
        }
    };

    data.and_then(|data| Frame::new(data, width, height, layout, std::time::Instant::now(), sequence))
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))
}

struct V4l2Stream {
    frames: mpsc::Receiver<Result<Frame, CameraError>>,
    stop: Arc<AtomicBool>,
    /// Set once the capture thread has dropped the device. A stop request
    /// lands between two dequeues, so this trails `stop` by up to a frame.
    released: Arc<AtomicBool>,
}

#[async_trait]
impl VideoStream for V4l2Stream {
    async fn next_frame(&mut self) -> Option<Result<Frame, CameraError>> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        self.frames.recv().await
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.frames.close();
    }

    fn track_state(&self) -> TrackState {
        if self.released.load(Ordering::Acquire) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

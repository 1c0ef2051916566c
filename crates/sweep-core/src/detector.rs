//! Face detection.
//!
//! [`FaceDetector`] is the seam the frame sampler calls once per tick. The
//! shipped implementation is [`ScrfdDetector`], an SCRFD model run through
//! ONNX Runtime with anchor-free decoding over three strides, followed by NMS.
//! It emits the 5-point SCRFD landmark layout.

use crate::types::{BoundingBox, FaceObservation, GrayImage, LandmarkLayout, Landmarks};
use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const KEYPOINTS: usize = 5;

/// File name looked up under the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("image buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    BadImage {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a grayscale image.
///
/// Implementations return every face scoring at least `min_confidence`,
/// best first. An empty vector means no face.
pub trait FaceDetector: Send {
    fn detect(
        &mut self,
        image: &GrayImage<'_>,
        min_confidence: f32,
    ) -> Result<Vec<FaceObservation>, DetectorError>;
}

/// Maps letterboxed model coordinates back to frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> (Self, usize, usize) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).min(target);
        let new_h = ((height as f32 * scale).round() as usize).min(target);
        let letterbox = Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD detector backed by an ONNX Runtime session.
pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = output_layout(&names);

        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");
        Ok(Self { session, outputs })
    }

    /// Load [`SCRFD_MODEL_FILE`] from `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self, DetectorError> {
        Self::load(&model_dir.join(SCRFD_MODEL_FILE))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        image: &GrayImage<'_>,
        min_confidence: f32,
    ) -> Result<Vec<FaceObservation>, DetectorError> {
        let (width, height) = (image.width as usize, image.height as usize);
        let expected = width * height;
        if width == 0 || height == 0 || image.data.len() < expected {
            return Err(DetectorError::BadImage {
                width: image.width,
                height: image.height,
                expected,
                actual: image.data.len(),
            });
        }

        let (input, letterbox) = preprocess(image.data, width, height);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[slot];
            let tensors = StrideTensors {
                scores: tensor_data(&outputs[score_idx], "scores", stride)?,
                bboxes: tensor_data(&outputs[bbox_idx], "bboxes", stride)?,
                kps: tensor_data(&outputs[kps_idx], "kps", stride)?,
            };
            candidates.extend(decode_stride(&tensors, stride, &letterbox, min_confidence));
        }

        let faces = nms(candidates, NMS_IOU)
            .into_iter()
            .map(|c| FaceObservation {
                bbox: c.bbox,
                confidence: c.score,
                landmarks: c.keypoints.map(|k| Landmarks::new(LandmarkLayout::Scrfd5, k.to_vec())),
                timestamp: image.captured_at,
            })
            .collect::<Vec<_>>();

        tracing::trace!(faces = faces.len(), "SCRFD pass");
        Ok(faces)
    }
}

fn tensor_data<'a>(value: &'a DynValue, what: &str, stride: usize) -> Result<&'a [f32], DetectorError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
}

/// Bilinear letterbox into a 640x640 NCHW tensor, gray replicated to 3 channels.
fn preprocess(frame: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(width, height, INPUT_SIZE);
    let resized = resize_bilinear(frame, width, height, new_w, new_h);

    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;

    // Padding uses the mean so it normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..new_h {
        for x in 0..new_w {
            let v = (resized[y * new_w + x] as f32 - PIXEL_MEAN) / PIXEL_STD;
            for c in 0..3 {
                tensor[[0, c, y0 + y, x0 + x]] = v;
            }
        }
    }
    (tensor, letterbox)
}

fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let sx = width as f32 / new_w.max(1) as f32;
    let sy = height as f32 / new_h.max(1) as f32;
    let mut out = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let fy_src = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy_src as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = fy_src - y0 as f32;

        for x in 0..new_w {
            let fx_src = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx_src as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = fx_src - x0 as f32;

            let top = src[y0 * width + x0] as f32 * (1.0 - fx) + src[y0 * width + x1] as f32 * fx;
            let bottom = src[y1 * width + x0] as f32 * (1.0 - fx) + src[y1 * width + x1] as f32 * fx;
            out[y * new_w + x] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Name-based output mapping ("score_8", "bbox_16", "kps_32", ...) with a
/// positional fallback of scores 0-2, bboxes 3-5, kps 6-8.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |stride: usize| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?));

    match (named(STRIDES[0]), named(STRIDES[1]), named(STRIDES[2])) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoundingBox,
    score: f32,
    keypoints: Option<[(f32, f32); KEYPOINTS]>,
}

fn decode_stride(
    tensors: &StrideTensors<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = INPUT_SIZE / stride;
    let anchors = grid * grid * ANCHORS_PER_CELL;
    let step = stride as f32;
    let mut out = Vec::new();

    for idx in 0..anchors {
        let score = tensors.scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }
        let Some(d) = tensors.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
        let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

        let keypoints = tensors
            .kps
            .get(idx * KEYPOINTS * 2..(idx + 1) * KEYPOINTS * 2)
            .map(|k| std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)));

        out.push(Candidate {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            score,
            keypoints,
        });
    }
    out
}

/// Greedy non-maximum suppression; output is sorted best first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: f32, y: f32, size: f32, score: f32) -> Candidate {
        Candidate {
            bbox: BoundingBox {
                x,
                y,
                width: size,
                height: size,
            },
            score,
            keypoints: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlap_and_sorts() {
        let kept = nms(
            vec![
                candidate(200.0, 200.0, 50.0, 0.7),
                candidate(5.0, 5.0, 100.0, 0.8),
                candidate(0.0, 0.0, 100.0, 0.9),
            ],
            NMS_IOU,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), NMS_IOU).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_inverts_fit() {
        let (lb, new_w, new_h) = Letterbox::fit(320, 240, INPUT_SIZE);
        assert_eq!((new_w, new_h), (640, 480));
        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3);
        assert!((y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_output_layout_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_layout(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(output_layout(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![128u8; 100 * 100];
        let out = resize_bilinear(&src, 100, 100, 200, 200);
        assert!(out.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_decode_respects_threshold_and_emits_landmarks() {
        let grid = INPUT_SIZE / 32;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let mut kps = vec![0.0f32; anchors * KEYPOINTS * 2];

        // Anchor 2 sits in cell 1: (32, 0) in input space.
        scores[2] = 0.15;
        scores[4] = 0.05;
        bboxes[8..12].copy_from_slice(&[1.0, 0.0, 1.0, 2.0]);
        kps[20..30].copy_from_slice(&[0.5; 10]);

        let tensors = StrideTensors {
            scores: &scores,
            bboxes: &bboxes,
            kps: &kps,
        };
        let identity = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = decode_stride(&tensors, 32, &identity, 0.1);

        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!(c.bbox, BoundingBox { x: 0.0, y: 0.0, width: 64.0, height: 64.0 });
        let kp = c.keypoints.unwrap();
        assert_eq!(kp[0], (48.0, 16.0));
    }
}

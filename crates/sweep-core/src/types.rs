use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Instant;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Semantic ordering of a landmark set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandmarkLayout {
    /// 68-point iBUG layout (dlib / face-api style).
    Ibug68,
    /// SCRFD 5-point layout: [left_eye, right_eye, nose, left_mouth, right_mouth].
    Scrfd5,
}

/// Index ranges of the points the pose estimator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseRegions {
    pub right_eye: Range<usize>,
    pub left_eye: Range<usize>,
    pub nose: Range<usize>,
    /// Index into `nose` used when the last nose point is unusable.
    pub nose_tip_fallback: usize,
}

impl LandmarkLayout {
    /// Number of points a detector must emit for this layout.
    pub fn point_count(self) -> usize {
        match self {
            LandmarkLayout::Ibug68 => 68,
            LandmarkLayout::Scrfd5 => 5,
        }
    }

    /// Vertical distance from the eye line down to the nose point the
    /// estimator uses, in inter-eye distances, for a frontal face.
    ///
    /// Scrfd5 is measured on the ArcFace 112x112 reference landmarks. Ibug68
    /// uses the outer nostril (point 35) on the 68-point mean shape and is
    /// approximate.
    pub fn neutral_nose_drop(self) -> f32 {
        match self {
            LandmarkLayout::Ibug68 => 0.76,
            LandmarkLayout::Scrfd5 => 0.5715,
        }
    }

    pub fn pose_regions(self) -> PoseRegions {
        match self {
            // 27-35 nose, 36-41 right eye, 42-47 left eye
            LandmarkLayout::Ibug68 => PoseRegions {
                right_eye: 36..42,
                left_eye: 42..48,
                nose: 27..36,
                nose_tip_fallback: 3,
            },
            LandmarkLayout::Scrfd5 => PoseRegions {
                right_eye: 1..2,
                left_eye: 0..1,
                nose: 2..3,
                nose_tip_fallback: 0,
            },
        }
    }
}

/// Landmark points of one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub layout: LandmarkLayout,
    pub points: Vec<(f32, f32)>,
}

impl Landmarks {
    pub fn new(layout: LandmarkLayout, points: Vec<(f32, f32)>) -> Self {
        Self { layout, points }
    }

    /// True when the point count covers the declared layout.
    pub fn is_complete(&self) -> bool {
        self.points.len() >= self.layout.point_count()
    }
}

/// One detector result for one sampled frame.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
    /// Capture time of the frame the face was found in.
    pub timestamp: Instant,
}

/// Borrowed grayscale image handed to a detector.
#[derive(Debug, Clone, Copy)]
pub struct GrayImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_layout_regions_fit_point_count() {
        for layout in [LandmarkLayout::Ibug68, LandmarkLayout::Scrfd5] {
            let regions = layout.pose_regions();
            let count = layout.point_count();
            assert!(regions.right_eye.end <= count);
            assert!(regions.left_eye.end <= count);
            assert!(regions.nose.end <= count);
            assert!(regions.nose_tip_fallback < regions.nose.len());
        }
    }

    #[test]
    fn test_incomplete_landmarks() {
        let lm = Landmarks::new(LandmarkLayout::Ibug68, vec![(0.0, 0.0); 40]);
        assert!(!lm.is_complete());
        let lm = Landmarks::new(LandmarkLayout::Scrfd5, vec![(0.0, 0.0); 5]);
        assert!(lm.is_complete());
    }
}

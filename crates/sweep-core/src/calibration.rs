//! Tunable pose gain and segment windows, loaded from TOML.

use crate::pose::PoseCalibration;
use crate::segments::{AngleRange, SegmentPlan, SegmentTarget, SEGMENT_COUNT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("failed to read calibration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid calibration TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize calibration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("expected 8 segments, got {0}")]
    SegmentCount(usize),
    #[error("segment {index}: {axis} range [{min}, {max}] is empty or not finite")]
    BadRange {
        index: usize,
        axis: &'static str,
        min: f32,
        max: f32,
    },
    #[error("pose.{field} = {value} is out of range")]
    BadPose { field: &'static str, value: f32 },
}

/// Effective calibration for one pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Calibration {
    pub pose: PoseCalibration,
    pub plan: SegmentPlan,
}

/// On-disk shape. `segments` may be omitted to keep the built-in windows.
#[derive(Serialize, Deserialize)]
struct CalibrationFile {
    #[serde(default)]
    pose: PoseCalibration,
    #[serde(default)]
    segments: Vec<SegmentTarget>,
}

impl Calibration {
    pub fn from_toml_str(text: &str) -> Result<Self, CalibrationError> {
        let file: CalibrationFile = toml::from_str(text)?;

        let plan = if file.segments.is_empty() {
            SegmentPlan::default()
        } else {
            let count = file.segments.len();
            let targets: [SegmentTarget; SEGMENT_COUNT] = file
                .segments
                .try_into()
                .map_err(|_| CalibrationError::SegmentCount(count))?;
            SegmentPlan { targets }
        };

        let calibration = Self {
            pose: file.pose,
            plan,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let calibration = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "loaded calibration");
        Ok(calibration)
    }

    /// Load `path` if given, otherwise use the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, CalibrationError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, CalibrationError> {
        let file = CalibrationFile {
            pose: self.pose,
            segments: self.plan.targets.to_vec(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        let pose = &self.pose;
        if !(pose.alpha > 0.0 && pose.alpha <= 1.0) {
            return Err(CalibrationError::BadPose {
                field: "alpha",
                value: pose.alpha,
            });
        }
        if !(pose.clamp.is_finite() && pose.clamp > 0.0) {
            return Err(CalibrationError::BadPose {
                field: "clamp",
                value: pose.clamp,
            });
        }
        if !(pose.gain.is_finite() && pose.gain > 0.0) {
            return Err(CalibrationError::BadPose {
                field: "gain",
                value: pose.gain,
            });
        }
        if !pose.pitch_offset.is_finite() {
            return Err(CalibrationError::BadPose {
                field: "pitch_offset",
                value: pose.pitch_offset,
            });
        }
        if !(pose.min_eye_distance.is_finite() && pose.min_eye_distance >= 0.0) {
            return Err(CalibrationError::BadPose {
                field: "min_eye_distance",
                value: pose.min_eye_distance,
            });
        }

        for (index, target) in self.plan.targets.iter().enumerate() {
            check_range(index, "yaw", target.yaw)?;
            check_range(index, "pitch", target.pitch)?;
        }
        Ok(())
    }
}

fn check_range(index: usize, axis: &'static str, range: AngleRange) -> Result<(), CalibrationError> {
    if range.min.is_finite() && range.max.is_finite() && range.min <= range.max {
        Ok(())
    } else {
        Err(CalibrationError::BadRange {
            index,
            axis,
            min: range.min,
            max: range.max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::Direction;

    const SHIPPED: &str = include_str!("../../../contrib/calibration/default.toml");

    #[test]
    fn test_shipped_file_matches_builtin_defaults() {
        let parsed = Calibration::from_toml_str(SHIPPED).unwrap();
        assert_eq!(parsed, Calibration::default());
    }

    #[test]
    fn test_serialized_defaults_parse_back() {
        let text = Calibration::default().to_toml_string().unwrap();
        assert_eq!(Calibration::from_toml_str(&text).unwrap(), Calibration::default());
    }

    #[test]
    fn test_partial_file_keeps_default_windows() {
        let cal = Calibration::from_toml_str("[pose]\ngain = 120.0\n").unwrap();
        assert_eq!(cal.pose.gain, 120.0);
        assert_eq!(cal.pose.alpha, 0.8);
        assert_eq!(cal.plan, SegmentPlan::default());
    }

    #[test]
    fn test_wrong_segment_count_rejected() {
        let text = r#"
[[segments]]
direction = "right"
yaw = { min = 10.0, max = 70.0 }
pitch = { min = -20.0, max = 20.0 }
"#;
        let err = Calibration::from_toml_str(text).unwrap_err();
        assert!(matches!(err, CalibrationError::SegmentCount(1)));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut cal = Calibration::default();
        cal.plan.targets[2].pitch = AngleRange::new(10.0, -10.0);
        let err = cal.validate().unwrap_err();
        assert!(matches!(err, CalibrationError::BadRange { index: 2, axis: "pitch", .. }));
    }

    #[test]
    fn test_bad_alpha_rejected() {
        let err = Calibration::from_toml_str("[pose]\nalpha = 1.5\n").unwrap_err();
        assert!(matches!(err, CalibrationError::BadPose { field: "alpha", .. }));
    }

    #[test]
    fn test_directions_in_sweep_order() {
        let order: Vec<Direction> = Calibration::default()
            .plan
            .targets
            .iter()
            .map(|t| t.direction)
            .collect();
        assert_eq!(
            order,
            vec![
                Direction::Right,
                Direction::UpRight,
                Direction::Up,
                Direction::UpLeft,
                Direction::Left,
                Direction::DownLeft,
                Direction::Down,
                Direction::DownRight,
            ]
        );
    }
}

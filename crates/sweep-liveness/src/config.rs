use std::path::PathBuf;
use std::time::Duration;
use sweep_hw::{CaptureOptions, RecordingBudget, Resolution};

/// Which message bus the face registry lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBus {
    Session,
    System,
}

/// Pipeline configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Period of the detection tick.
    pub sample_interval: Duration,
    /// Detector score floor. Kept low: a missed face stalls the sweep.
    pub min_detection_confidence: f32,
    /// Gap without a face after which presence is reported as lost.
    pub face_absent_timeout: Duration,
    pub stream_ready_timeout: Duration,
    pub capture_resolution: Resolution,
    pub recording: RecordingBudget,
    /// Pause before the still capture so the user can face forward.
    pub settle: Duration,
    pub still_jpeg_quality: u8,
    /// Optional calibration TOML overriding the built-in windows.
    pub calibration_path: Option<PathBuf>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub registry_bus: RegistryBus,
    pub registry_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from `SWEEP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str, default: u64| var(key).and_then(|v| v.parse().ok()).unwrap_or(default);
        let parse_f32 = |key: &str, default: f32| var(key).and_then(|v| v.parse().ok()).unwrap_or(default);

        let max_mb = parse_f32("SWEEP_RECORDING_MAX_MB", 9.5).max(0.0);

        Self {
            sample_interval: Duration::from_millis(parse_u64("SWEEP_SAMPLE_INTERVAL_MS", 100).max(1)),
            min_detection_confidence: parse_f32("SWEEP_MIN_DETECTION_CONFIDENCE", 0.1),
            face_absent_timeout: Duration::from_millis(parse_u64("SWEEP_FACE_ABSENT_MS", 2000)),
            stream_ready_timeout: Duration::from_millis(parse_u64("SWEEP_STREAM_READY_TIMEOUT_MS", 3000)),
            capture_resolution: Resolution::new(
                parse_u64("SWEEP_CAPTURE_WIDTH", 1280) as u32,
                parse_u64("SWEEP_CAPTURE_HEIGHT", 720) as u32,
            ),
            recording: RecordingBudget {
                max_duration: Duration::from_secs(parse_u64("SWEEP_RECORDING_MAX_SECS", 30).max(1)),
                max_bytes: (max_mb * 1024.0 * 1024.0) as u64,
                timeslice: Duration::from_millis(parse_u64("SWEEP_RECORDING_TIMESLICE_MS", 500).max(1)),
            },
            settle: Duration::from_secs(parse_u64("SWEEP_SETTLE_SECS", 3)),
            still_jpeg_quality: parse_u64("SWEEP_STILL_JPEG_QUALITY", 90).clamp(1, 100) as u8,
            calibration_path: var("SWEEP_CALIBRATION").filter(|v| !v.is_empty()).map(PathBuf::from),
            model_dir: var("SWEEP_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_model_dir(&var)),
            registry_bus: match var("SWEEP_REGISTRY_BUS").as_deref() {
                Some("system") => RegistryBus::System,
                _ => RegistryBus::Session,
            },
            registry_timeout: Duration::from_secs(parse_u64("SWEEP_REGISTRY_TIMEOUT_SECS", 10)),
        }
    }

    /// Camera settings for the capture controller.
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            resolution: self.capture_resolution,
            ready_timeout: self.stream_ready_timeout,
            ..CaptureOptions::default()
        }
    }

    /// Hard wall-clock ceiling of one recording attempt.
    pub fn attempt_ceiling(&self) -> Duration {
        self.recording.max_duration
    }
}

/// `$XDG_DATA_HOME/sweep/models`, falling back to `~/.local/share/sweep/models`.
fn default_model_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("sweep/models")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("HOME", "/home/ana")]);
        assert_eq!(config.sample_interval, Duration::from_millis(100));
        assert_eq!(config.min_detection_confidence, 0.1);
        assert_eq!(config.face_absent_timeout, Duration::from_secs(2));
        assert_eq!(config.stream_ready_timeout, Duration::from_secs(3));
        assert_eq!(config.capture_resolution, Resolution::new(1280, 720));
        assert_eq!(config.recording.max_duration, Duration::from_secs(30));
        assert_eq!(config.recording.max_bytes, 9_961_472);
        assert_eq!(config.recording.timeslice, Duration::from_millis(500));
        assert_eq!(config.settle, Duration::from_secs(3));
        assert_eq!(config.still_jpeg_quality, 90);
        assert_eq!(config.calibration_path, None);
        assert_eq!(config.model_dir, PathBuf::from("/home/ana/.local/share/sweep/models"));
        assert_eq!(config.registry_bus, RegistryBus::Session);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SWEEP_SAMPLE_INTERVAL_MS", "50"),
            ("SWEEP_RECORDING_MAX_SECS", "12"),
            ("SWEEP_RECORDING_MAX_MB", "1"),
            ("SWEEP_STILL_JPEG_QUALITY", "250"),
            ("SWEEP_CALIBRATION", "/etc/sweep/calibration.toml"),
            ("SWEEP_REGISTRY_BUS", "system"),
            ("XDG_DATA_HOME", "/data"),
        ]);
        assert_eq!(config.sample_interval, Duration::from_millis(50));
        assert_eq!(config.attempt_ceiling(), Duration::from_secs(12));
        assert_eq!(config.recording.max_bytes, 1024 * 1024);
        assert_eq!(config.still_jpeg_quality, 100);
        assert_eq!(config.calibration_path, Some(PathBuf::from("/etc/sweep/calibration.toml")));
        assert_eq!(config.registry_bus, RegistryBus::System);
        assert_eq!(config.model_dir, PathBuf::from("/data/sweep/models"));
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = config_from(&[("SWEEP_SAMPLE_INTERVAL_MS", "fast"), ("SWEEP_MIN_DETECTION_CONFIDENCE", "")]);
        assert_eq!(config.sample_interval, Duration::from_millis(100));
        assert_eq!(config.min_detection_confidence, 0.1);
    }

    #[test]
    fn test_capture_options_follow_config() {
        let config = config_from(&[("SWEEP_CAPTURE_WIDTH", "640"), ("SWEEP_STREAM_READY_TIMEOUT_MS", "500")]);
        let options = config.capture_options();
        assert_eq!(options.resolution, Resolution::new(640, 720));
        assert_eq!(options.ready_timeout, Duration::from_millis(500));
    }
}

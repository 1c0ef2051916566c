//! sweep-liveness — Head-sweep liveness capture pipeline.
//!
//! Ties the capture controller, the pose state machine and a face registry
//! into one host-facing component, [`LivenessCapture`]. Progress is observable
//! as a `watch` snapshot and a `broadcast` event stream.

pub mod artifact;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod registry;
mod sampler;
mod timers;

pub use artifact::{ArtifactSummary, CaptureSuccess, CapturedArtifact};
pub use config::{Config, RegistryBus};
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{HostCallbacks, LivenessCapture, LivenessCaptureBuilder, NoopCallbacks};
pub use progress::{PipelineEvent, Progress, Stage};
pub use registry::{DbusFaceRegistry, DryRunRegistry, FaceRegistry, IndexFaceResponse, RegistryError};

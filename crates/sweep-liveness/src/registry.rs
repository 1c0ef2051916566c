//! Face registration collaborator.
//!
//! The pipeline hands the captured still and the user id to a
//! [`FaceRegistry`] and awaits one answer. The D-Bus client talks to a
//! service exporting `org.sweep.FaceIndex1`:
//!
//! ```text
//! IndexFace(image: ay, user_id: s) -> s   // JSON {"success", "faceId"?, "error"?}
//! ```

use crate::config::RegistryBus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),
    #[error("invalid registry response: {0}")]
    BadResponse(#[from] serde_json::Error),
}

/// Registry reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFaceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexFaceResponse {
    pub fn indexed(face_id: impl Into<String>) -> Self {
        Self {
            success: true,
            face_id: Some(face_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            face_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait FaceRegistry: Send + Sync {
    /// Index the JPEG `image` as the reference face of `user_id`.
    async fn index_face(&self, image: &[u8], user_id: &str) -> Result<IndexFaceResponse, RegistryError>;
}

// `#[zbus::proxy]` generates `FaceIndexProxy` (async) and a blocking twin.
#[zbus::proxy(
    interface = "org.sweep.FaceIndex1",
    default_service = "org.sweep.FaceIndex1",
    default_path = "/org/sweep/FaceIndex1"
)]
trait FaceIndex {
    async fn index_face(&self, image: &[u8], user_id: &str) -> zbus::Result<String>;
}

/// Registry reached over D-Bus.
pub struct DbusFaceRegistry {
    connection: zbus::Connection,
}

impl DbusFaceRegistry {
    /// Connect to `bus`. Calls fail after `timeout` instead of hanging the capture.
    pub async fn connect(bus: RegistryBus, timeout: Duration) -> Result<Self, RegistryError> {
        let builder = match bus {
            RegistryBus::Session => zbus::connection::Builder::session()?,
            RegistryBus::System => zbus::connection::Builder::system()?,
        };
        let connection = builder.method_timeout(timeout).build().await?;
        tracing::debug!(?bus, "connected to face registry bus");
        Ok(Self { connection })
    }
}

#[async_trait]
impl FaceRegistry for DbusFaceRegistry {
    async fn index_face(&self, image: &[u8], user_id: &str) -> Result<IndexFaceResponse, RegistryError> {
        let proxy = FaceIndexProxy::new(&self.connection).await?;
        let reply = proxy.index_face(image, user_id).await?;
        Ok(serde_json::from_str(&reply)?)
    }
}

/// Accepts every face without contacting anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRegistry;

#[async_trait]
impl FaceRegistry for DryRunRegistry {
    async fn index_face(&self, image: &[u8], user_id: &str) -> Result<IndexFaceResponse, RegistryError> {
        let face_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(user = user_id, bytes = image.len(), face_id = %face_id, "dry run: face not sent");
        Ok(IndexFaceResponse::indexed(face_id))
    }
}

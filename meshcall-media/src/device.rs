use crate::error::MediaError;
use crate::track::LocalTrack;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Direction a camera is facing. `User` is the front camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl Display for FacingMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub device_id: String,
    pub label: String,
    pub facing: Option<FacingMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoConstraints {
    Facing(FacingMode),
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing_mode: FacingMode,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            facing_mode: FacingMode::User,
        }
    }
}

/// Platform capture capability. Opened tracks produce frames until stopped.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    async fn enumerate_cameras(&self) -> Result<Vec<CameraDevice>, MediaError>;
    async fn open_audio(&self) -> Result<Arc<LocalTrack>, MediaError>;
    async fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Arc<LocalTrack>, MediaError>;
}

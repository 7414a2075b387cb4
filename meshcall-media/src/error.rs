use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Media capture is not available: {0}")]
    MediaUnavailable(String),
    #[error("Permission to use the capture device was denied")]
    DevicePermissionDenied,
    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("Failed to switch camera: {0}")]
    CameraSwitchFailed(CameraSwitchFailure),
    #[error("Local media has not been acquired")]
    NotAcquired,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraSwitchFailure {
    #[error("a camera switch is already in progress")]
    InProgress,
    #[error("only one camera available")]
    SingleCamera,
    #[error("camera is turned off")]
    CameraOff,
    #[error("no live video track")]
    NoVideoTrack,
    #[error("{reason}")]
    Acquisition {
        reason: String,
        /// The previous video track was already stopped, local video is gone until reacquired.
        video_lost: bool,
    },
}

impl From<CameraSwitchFailure> for MediaError {
    fn from(failure: CameraSwitchFailure) -> Self {
        MediaError::CameraSwitchFailed(failure)
    }
}

impl MediaError {
    /// Whether the error was rejected by a pre-check, leaving all tracks untouched.
    pub fn is_rejected_switch(&self) -> bool {
        matches!(
            self,
            MediaError::CameraSwitchFailed(
                CameraSwitchFailure::InProgress
                    | CameraSwitchFailure::SingleCamera
                    | CameraSwitchFailure::CameraOff
                    | CameraSwitchFailure::NoVideoTrack
            )
        )
    }
}

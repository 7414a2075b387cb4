use meshcall_media::{CameraSwitchFailure, MediaError};
use meshcall_signaling::error::SignalingError;
use meshcall_signaling::protocol::ws::ErrorReason;
use meshcall_webrtc::error::WebrtcError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Media(#[from] Box<MediaError>),
    #[error("Signaling error: {0}")]
    Signaling(#[from] Box<SignalingError>),
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] Box<WebrtcError>),
    #[error("Room has been left")]
    RoomClosed,
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(Box::new(err))
    }
}

impl From<CameraSwitchFailure> for Error {
    fn from(failure: CameraSwitchFailure) -> Self {
        Error::Media(Box::new(failure.into()))
    }
}

impl From<SignalingError> for Error {
    fn from(err: SignalingError) -> Self {
        Error::Signaling(Box::new(err))
    }
}

impl From<WebrtcError> for Error {
    fn from(err: WebrtcError) -> Self {
        Error::Webrtc(Box::new(err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(Box::new(err))
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        UserFacingError::from(self).serialize(serializer)
    }
}

pub trait LogErrExt<R> {
    fn log_err(self) -> Result<R, Error>;
}

impl<R> LogErrExt<R> for Result<R, Error> {
    fn log_err(self) -> Result<R, Error> {
        match self {
            Ok(val) => Ok(val),
            Err(err) => {
                tracing::error!("{err:?}");
                Err(err)
            }
        }
    }
}

/// An error as presented to the participant, with an optional hint on how to recover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFacingError {
    title: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remedy: Option<String>,
    is_non_critical: bool,
}

impl UserFacingError {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            remedy: None,
            is_non_critical: false,
        }
    }

    pub fn non_critical(mut self) -> Self {
        self.is_non_critical = true;
        self
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy = Some(remedy.into());
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn remedy(&self) -> Option<&str> {
        self.remedy.as_deref()
    }

    pub fn is_non_critical(&self) -> bool {
        self.is_non_critical
    }
}

impl From<Error> for UserFacingError {
    fn from(err: Error) -> Self {
        UserFacingError::from(&err)
    }
}

impl From<&Error> for UserFacingError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Media(err) => UserFacingError::from(err.as_ref()),
            Error::Signaling(err) => {
                UserFacingError::new("Signaling error", format_signaling_error(err))
            }
            Error::Webrtc(err) => UserFacingError::new("Connection error", err.to_string()),
            Error::RoomClosed => {
                UserFacingError::new("Room closed", "You already left this room.").non_critical()
            }
            Error::Other(err) => UserFacingError::new("Error", err.to_string()),
        }
    }
}

impl From<&MediaError> for UserFacingError {
    fn from(err: &MediaError) -> Self {
        match err {
            MediaError::MediaUnavailable(reason) => UserFacingError::new(
                "Camera and microphone unavailable",
                format!("Media capture is not available: {reason}"),
            )
            .with_remedy("Open the call over HTTPS or from localhost and check your devices."),
            MediaError::DevicePermissionDenied => UserFacingError::new(
                "Permission denied",
                "Access to camera and microphone was denied.",
            )
            .with_remedy("Allow camera and microphone access and join again."),
            MediaError::DeviceNotFound(device) => {
                UserFacingError::new("Device not found", format!("No such device: {device}"))
            }
            MediaError::CameraSwitchFailed(failure) => format_camera_switch_failure(failure),
            MediaError::NotAcquired => {
                UserFacingError::new("Media error", "Local media has not been acquired yet.")
            }
            MediaError::Other(err) => UserFacingError::new("Media error", err.to_string()),
        }
    }
}

fn format_camera_switch_failure(failure: &CameraSwitchFailure) -> UserFacingError {
    const TITLE: &str = "Camera flip failed";
    match failure {
        CameraSwitchFailure::InProgress => {
            UserFacingError::new(TITLE, "The camera is already being flipped.").non_critical()
        }
        CameraSwitchFailure::SingleCamera => {
            UserFacingError::new(TITLE, "Only one camera available. Cannot flip.").non_critical()
        }
        CameraSwitchFailure::CameraOff => {
            UserFacingError::new(TITLE, "Please turn on camera first before flipping!")
                .non_critical()
        }
        CameraSwitchFailure::NoVideoTrack => {
            UserFacingError::new(TITLE, "There is no active camera to flip.").non_critical()
        }
        CameraSwitchFailure::Acquisition { reason, video_lost } => {
            let err = UserFacingError::new(TITLE, format!("Failed to flip camera: {reason}"));
            if *video_lost {
                err.with_remedy("Your camera stopped. Retry to turn it back on or refresh the page.")
            } else {
                err.with_remedy("Please try again or refresh the page.")
            }
        }
    }
}

fn format_signaling_error(err: &SignalingError) -> String {
    match err {
        SignalingError::ConnectionError(err) => {
            format!("Could not reach the signaling server: {err}")
        }
        SignalingError::Disconnected => "Lost connection to the signaling server.".to_string(),
        SignalingError::RelayError(reason) => match reason {
            ErrorReason::MalformedMessage => "Server error: Malformed message.".to_string(),
            ErrorReason::Internal(msg) => format!("Internal server error: {msg}"),
            ErrorReason::NotInRoom => "Server error: Not in a room.".to_string(),
            ErrorReason::UnexpectedMessage(msg) => {
                format!("Server error: Unexpected message: {msg}")
            }
        },
        err => err.to_string(),
    }
}

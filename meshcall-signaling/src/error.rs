use meshcall_protocol::ws::ErrorReason;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection error: {0}")]
    ConnectionError(#[from] Box<tungstenite::error::Error>),
    #[error("disconnected")]
    Disconnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("serialization error: {0}")]
    SerializationError(#[from] Box<serde_json::Error>),
    #[error("failed to send signaling message: {0}")]
    SendFailure(String),
    #[error("signaling protocol error: {0}")]
    ProtocolError(String),
    #[error("relay error: {0:?}")]
    RelayError(ErrorReason),
    #[error("transport error: {0}")]
    Transport(#[from] Box<anyhow::Error>),
}

impl From<tungstenite::error::Error> for SignalingError {
    fn from(err: tungstenite::error::Error) -> Self {
        SignalingError::ConnectionError(Box::new(err))
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::SerializationError(Box::new(err))
    }
}

impl From<anyhow::Error> for SignalingError {
    fn from(err: anyhow::Error) -> Self {
        SignalingError::Transport(Box::new(err))
    }
}

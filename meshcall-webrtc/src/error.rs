use crate::session::SignalingState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),
    #[error("Negotiation state mismatch: expected {expected}, but session is {actual}")]
    NegotiationStateMismatch {
        expected: SignalingState,
        actual: SignalingState,
    },
    #[error("Session closed")]
    SessionClosed,
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for WebrtcError {
    fn from(err: anyhow::Error) -> Self {
        WebrtcError::Other(Box::new(err))
    }
}

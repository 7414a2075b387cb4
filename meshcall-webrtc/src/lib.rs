pub mod config;
mod engine;
pub mod error;
#[cfg(feature = "test-utils")]
pub mod mock;
mod peer;
mod receiver;
mod registry;
mod sender;
mod session;

pub use engine::{ConnectionState, PeerEvent, RemoteTrack, RtcConnection, RtcEngine};
pub use peer::{WebrtcConnection, WebrtcEngine};
pub use receiver::Receiver;
pub use registry::PeerRegistry;
pub use sender::Sender;
pub use session::{AnswerOutcome, PeerSession, RemoteStream, RemoteStreamChange, SignalingState};

#[cfg(feature = "ice")]
pub mod ice;
#[cfg(feature = "ws")]
pub mod ws;

#[cfg(feature = "ws")]
pub use ws::{MessageKind, SignalingMessage};

pub const MESHCALL_PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

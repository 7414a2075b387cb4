#[cfg(feature = "test-utils")]
pub mod mock;
pub mod tokio;

use crate::error::SignalingError;
use async_trait::async_trait;
use meshcall_protocol::ws::SignalingMessage;

#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    type Sender: SignalingSender;
    type Receiver: SignalingReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError>;
}

#[async_trait]
pub trait SignalingSender: Send + Sync + 'static {
    async fn send(&mut self, msg: SignalingMessage) -> Result<(), SignalingError>;
    async fn close(&mut self) -> Result<(), SignalingError>;
}

#[async_trait]
pub trait SignalingReceiver: Send + Sync + 'static {
    async fn recv(&mut self) -> Result<SignalingMessage, SignalingError>;
}

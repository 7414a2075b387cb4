use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::ws::SignalingMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport exchanging JSON encoded [`SignalingMessage`]s as text frames.
#[derive(Debug, Clone)]
pub struct TokioTransport {
    url: String,
}

impl TokioTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::info!("Connecting to signaling relay");
        let (websocket_stream, response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|err| {
                tracing::error!(?err, "Failed to connect to signaling relay");
                SignalingError::from(err)
            })?;
        tracing::debug!(?response, "WebSocket handshake response");

        let (websocket_tx, websocket_rx) = websocket_stream.split();

        tracing::info!("Successfully established connection to signaling relay");
        Ok((
            TokioSender { websocket_tx },
            TokioReceiver { websocket_rx },
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WebSocket, tungstenite::Message>,
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalingSender for TokioSender {
    #[tracing::instrument(level = "debug", skip(self, msg), fields(kind = %msg.kind()), err)]
    async fn send(&mut self, msg: SignalingMessage) -> Result<(), SignalingError> {
        let serialized = SignalingMessage::serialize(&msg).map_err(|err| {
            tracing::warn!(?err, "Failed to serialize message");
            SignalingError::from(err)
        })?;

        tracing::trace!("Sending message to relay");
        self.websocket_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|err| {
                tracing::warn!(?err, "Failed to send message");
                SignalingError::SendFailure(err.to_string())
            })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingError> {
        let _ = self
            .websocket_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingError::from(err)
        })
    }
}

#[async_trait]
impl SignalingReceiver for TokioReceiver {
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn recv(&mut self) -> Result<SignalingMessage, SignalingError> {
        while let Some(msg) = self.websocket_rx.next().await {
            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    tracing::trace!("Received message");
                    return SignalingMessage::deserialize(&text).map_err(|err| {
                        tracing::warn!(?err, "Failed to deserialize message");
                        SignalingError::from(err)
                    });
                }
                Ok(tungstenite::Message::Close(reason)) => {
                    tracing::warn!(?reason, "Received Close WebSocket frame");
                    return Err(SignalingError::Disconnected);
                }
                Ok(other) => {
                    // Pings are answered by tungstenite on the next read.
                    tracing::trace!(?other, "Skipping non-text WebSocket frame");
                }
                Err(err) => {
                    tracing::warn!(?err, "Failed to receive message");
                    return Err(SignalingError::from(err));
                }
            }
        }

        tracing::warn!("WebSocket stream ended");
        Err(SignalingError::Disconnected)
    }
}

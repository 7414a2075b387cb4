use crate::config::REMOTE_PACKETS_CAPACITY;
use crate::error::WebrtcError;
use async_trait::async_trait;
use bytes::Bytes;
use meshcall_media::{LocalTrack, TrackKind};
use meshcall_protocol::ice::IceConfig;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track received from a remote peer. Cloning shares the packet feed.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    packets_tx: broadcast::Sender<Bytes>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        let (packets_tx, _) = broadcast::channel(REMOTE_PACKETS_CAPACITY);
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            packets_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.packets_tx.subscribe()
    }

    pub(crate) fn publish(&self, payload: Bytes) {
        let _ = self.packets_tx.send(payload);
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(ConnectionState),
    /// A locally gathered candidate, `None` once gathering completed.
    IceCandidate(Option<String>),
    Track(RemoteTrack),
    TrackEnded { track_id: String },
    Error(String),
}

/// One RTC connection to a remote peer, as provided by an [`RtcEngine`].
///
/// Session descriptions and candidates are opaque strings exchanged verbatim over signaling.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Starts sending the given local track. Frames are forwarded while the track is enabled.
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), WebrtcError>;
    /// Kind and ID of every local track currently being sent.
    fn sender_tracks(&self) -> Vec<(TrackKind, String)>;
    /// Swaps the local track feeding the sender of the same kind, without renegotiation.
    ///
    /// Returns `false` if no sender of that kind exists.
    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<bool, WebrtcError>;
    async fn create_offer(&self) -> Result<String, WebrtcError>;
    async fn create_answer(&self) -> Result<String, WebrtcError>;
    async fn set_local_description(&self, sdp: &str) -> Result<(), WebrtcError>;
    async fn set_remote_description(&self, sdp: &str) -> Result<(), WebrtcError>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), WebrtcError>;
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
    async fn close(&self) -> Result<(), WebrtcError>;
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_connection(
        &self,
        ice: &IceConfig,
    ) -> Result<Arc<dyn RtcConnection>, WebrtcError>;
}

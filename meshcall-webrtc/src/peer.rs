use crate::config::{IntoRtc, PEER_EVENTS_CAPACITY, RTCP_BUFFER_SIZE};
use crate::engine::{ConnectionState, PeerEvent, RtcConnection, RtcEngine};
use crate::error::WebrtcError;
use crate::receiver::Receiver;
use crate::sender::Sender;
use anyhow::Context;
use async_trait::async_trait;
use meshcall_media::{LocalTrack, TrackKind};
use meshcall_protocol::ice::IceConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// [`RtcEngine`] backed by webrtc-rs.
///
/// All local tracks of one engine share a stream ID, so remote peers see them as a single stream.
pub struct WebrtcEngine {
    stream_id: String,
}

impl Default for WebrtcEngine {
    fn default() -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl WebrtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

#[async_trait]
impl RtcEngine for WebrtcEngine {
    async fn create_connection(
        &self,
        ice: &IceConfig,
    ) -> Result<Arc<dyn RtcConnection>, WebrtcError> {
        let connection = WebrtcConnection::new(ice, self.stream_id.clone()).await?;
        Ok(Arc::new(connection))
    }
}

struct OutboundTrack {
    track: Arc<TrackLocalStaticSample>,
    sender: Sender,
}

pub struct WebrtcConnection {
    peer_connection: RTCPeerConnection,
    stream_id: String,
    outbound: Mutex<Vec<OutboundTrack>>,
    receiver: Receiver,
    events_tx: broadcast::Sender<PeerEvent>,
}

impl WebrtcConnection {
    #[instrument(level = "debug", skip(ice), err)]
    pub async fn new(ice: &IceConfig, stream_id: String) -> Result<Self, WebrtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(ice.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let (events_tx, _) = broadcast::channel(PEER_EVENTS_CAPACITY);

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |state: RTCPeerConnectionState| {
                    tracing::trace!(?state, "Peer connection state changed");
                    if let Err(err) = events_tx.send(PeerEvent::ConnectionState(state.into())) {
                        tracing::warn!(?err, "Failed to send peer connection state event");
                    }
                    Box::pin(async {})
                },
            ));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    tracing::trace!(?candidate, "ICE candidate gathered");
                    let event = match candidate.map(|c| c.to_json()).transpose() {
                        Ok(Some(init)) => match serde_json::to_string(&init) {
                            Ok(init) => PeerEvent::IceCandidate(Some(init)),
                            Err(err) => {
                                tracing::warn!(?err, "Failed to serialize ICE candidate");
                                PeerEvent::Error(err.to_string())
                            }
                        },
                        Ok(None) => PeerEvent::IceCandidate(None),
                        Err(err) => {
                            tracing::warn!(?err, "Failed to serialize ICE candidate");
                            PeerEvent::Error(err.to_string())
                        }
                    };
                    if let Err(err) = events_tx.send(event) {
                        tracing::warn!(?err, "Failed to send ICE candidate event");
                    }
                    Box::pin(async {})
                },
            ));
        }

        let receiver = Receiver::new(&peer_connection, events_tx.clone());

        Ok(Self {
            peer_connection,
            stream_id,
            outbound: Mutex::new(Vec::new()),
            receiver,
            events_tx,
        })
    }
}

#[async_trait]
impl RtcConnection for WebrtcConnection {
    #[instrument(level = "debug", skip(self, track), fields(track_id = %track.id()), err)]
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), WebrtcError> {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            track.codec().into_rtc(),
            track.id().to_string(),
            self.stream_id.clone(),
        ));

        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add track to peer connection")?;

        // RTCP has to be read for interceptors like NACK to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let sender = Sender::new(Arc::clone(&sample_track), track);
        self.outbound.lock().push(OutboundTrack {
            track: sample_track,
            sender,
        });
        Ok(())
    }

    fn sender_tracks(&self) -> Vec<(TrackKind, String)> {
        self.outbound
            .lock()
            .iter()
            .map(|outbound| (outbound.sender.kind(), outbound.sender.track_id().to_string()))
            .collect()
    }

    #[instrument(level = "debug", skip(self, track), fields(track_id = %track.id()), err)]
    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<bool, WebrtcError> {
        let mut outbound = self.outbound.lock();
        let Some(entry) = outbound.iter_mut().find(|o| o.sender.kind() == track.kind()) else {
            tracing::debug!("No sender for track kind");
            return Ok(false);
        };

        // The RTP track stays in place, only its frame source changes.
        entry.sender.shutdown();
        entry.sender = Sender::new(Arc::clone(&entry.track), track);
        Ok(true)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn create_offer(&self) -> Result<String, WebrtcError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        let sdp = serde_json::to_string(&offer).context("Failed to serialize offer")?;
        Ok(sdp)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn create_answer(&self) -> Result<String, WebrtcError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        let sdp = serde_json::to_string(&answer).context("Failed to serialize answer")?;
        Ok(sdp)
    }

    #[instrument(level = "trace", skip(self, sdp), err)]
    async fn set_local_description(&self, sdp: &str) -> Result<(), WebrtcError> {
        let description = serde_json::from_str::<RTCSessionDescription>(sdp)
            .context("Failed to deserialize SDP")?;
        self.peer_connection
            .set_local_description(description)
            .await
            .context("Failed to set local description")?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, sdp), err)]
    async fn set_remote_description(&self, sdp: &str) -> Result<(), WebrtcError> {
        let description = serde_json::from_str::<RTCSessionDescription>(sdp)
            .context("Failed to deserialize SDP")?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, candidate), err)]
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), WebrtcError> {
        self.peer_connection
            .add_ice_candidate(
                serde_json::from_str::<RTCIceCandidateInit>(candidate)
                    .context("Failed to deserialize candidate")?,
            )
            .await
            .context("Failed to add remote ICE candidate")?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn close(&self) -> Result<(), WebrtcError> {
        tracing::debug!("Closing peer connection");
        let senders = std::mem::take(&mut *self.outbound.lock());
        for outbound in senders {
            if let Err(err) = outbound.sender.stop().await {
                tracing::warn!(?err, "Failed to stop sender");
            }
        }
        self.receiver.shutdown();

        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::trace!("Successfully closed peer connection");
        Ok(())
    }
}

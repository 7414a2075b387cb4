use crate::engine::{PeerEvent, RemoteTrack};
use meshcall_media::TrackKind;
use tokio::sync::{broadcast, watch};
use tracing::instrument;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Publishes every remote track of a connection as [`PeerEvent::Track`] and feeds its packets
/// until the track ends.
pub struct Receiver {
    shutdown_tx: watch::Sender<()>,
}

impl Receiver {
    #[instrument(level = "trace", skip_all)]
    pub fn new(
        peer_connection: &RTCPeerConnection,
        events_tx: broadcast::Sender<PeerEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        peer_connection.on_track(Box::new(move |track, _, _| {
            let events_tx = events_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        tracing::warn!(?other, "Ignoring remote track of unsupported kind");
                        return;
                    }
                };
                let remote = RemoteTrack::new(track.id(), track.stream_id(), kind);
                tracing::debug!(track_id = ?remote.id, stream_id = ?remote.stream_id, %kind, "Remote track received");
                let _ = events_tx.send(PeerEvent::Track(remote.clone()));

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping receiver");
                            break;
                        }
                        rtp = track.read_rtp() => {
                            match rtp {
                                Ok((packet, _)) => remote.publish(packet.payload),
                                Err(err) => {
                                    tracing::debug!(?err, "Remote track ended");
                                    break;
                                }
                            }
                        }
                    }
                }

                let _ = events_tx.send(PeerEvent::TrackEnded {
                    track_id: remote.id.clone(),
                });
            })
        }));

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

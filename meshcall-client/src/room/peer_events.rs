use super::RoomEvent;
use meshcall_signaling::channel::SignalingChannel;
use meshcall_signaling::protocol::ws::SignalingMessage;
use meshcall_signaling::transport::SignalingTransport;
use meshcall_webrtc::{PeerEvent, PeerSession, RemoteStreamChange};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::Instrument;

/// Forwards connection events of one session until it closes.
///
/// Local ICE candidates are held back until the offer or answer they belong to was handed to
/// signaling.
pub(crate) fn spawn<ST: SignalingTransport>(
    session: Arc<PeerSession>,
    channel: SignalingChannel<ST>,
    events_tx: broadcast::Sender<RoomEvent>,
) {
    let Some(mut events_rx) = session.take_events() else {
        tracing::warn!(peer_id = ?session.peer_id(), "Peer events already consumed");
        return;
    };

    let span = tracing::debug_span!(
        "peer_events",
        peer_id = %session.peer_id(),
        generation = session.generation()
    );
    tokio::spawn(
        async move {
            let close_token = session.close_token();
            loop {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => break,

                    event = events_rx.recv() => match event {
                        Ok(PeerEvent::IceCandidate(candidate)) => {
                            tokio::select! {
                                biased;
                                _ = close_token.cancelled() => break,
                                _ = session.local_description_sent() => {}
                            }
                            let msg = SignalingMessage::IceCandidate {
                                candidate,
                                peer_id: session.peer_id().to_string(),
                            };
                            if let Err(err) = channel.send(msg).await {
                                tracing::warn!(?err, "Failed to send local ICE candidate");
                            }
                        }
                        Ok(PeerEvent::Track(track)) => {
                            let event = match session.on_remote_track(track) {
                                RemoteStreamChange::Added(stream) => {
                                    tracing::debug!(stream_id = ?stream.stream_id(), "Remote stream added");
                                    RoomEvent::RemoteStreamAdded {
                                        peer_id: session.peer_id().to_string(),
                                        stream,
                                    }
                                }
                                RemoteStreamChange::Same(_) => continue,
                                RemoteStreamChange::Replaced { previous, current } => {
                                    tracing::debug!(
                                        previous = ?previous.stream_id(),
                                        current = ?current.stream_id(),
                                        "Remote stream replaced"
                                    );
                                    RoomEvent::RemoteStreamReplaced {
                                        peer_id: session.peer_id().to_string(),
                                        previous_stream_id: previous.stream_id().to_string(),
                                        stream: current,
                                    }
                                }
                            };
                            let _ = events_tx.send(event);
                        }
                        Ok(PeerEvent::TrackEnded { track_id }) => {
                            if session.on_remote_track_ended(&track_id) {
                                let _ = events_tx.send(RoomEvent::RemoteTrackEnded {
                                    peer_id: session.peer_id().to_string(),
                                    track_id,
                                    video_muted: session.remote_video_muted(),
                                });
                            }
                        }
                        Ok(PeerEvent::ConnectionState(state)) => {
                            tracing::debug!(?state, "Peer connection state changed");
                            let _ = events_tx.send(RoomEvent::PeerConnectionState {
                                peer_id: session.peer_id().to_string(),
                                state,
                            });
                        }
                        Ok(PeerEvent::Error(err)) => {
                            tracing::warn!(?err, "Peer connection reported an error");
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(?n, "Peer events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            tracing::trace!("Peer event pump stopped");
        }
        .instrument(span),
    );
}

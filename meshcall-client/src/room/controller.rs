use super::RoomEvent;
use super::peer_events;
use crate::error::Error;
use meshcall_media::LocalMediaSource;
use meshcall_signaling::channel::SignalingChannel;
use meshcall_signaling::protocol::ws::SignalingMessage;
use meshcall_signaling::transport::SignalingTransport;
use meshcall_webrtc::{AnswerOutcome, PeerRegistry, PeerSession, SignalingState};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{Instrument, instrument};

#[derive(Debug)]
pub(crate) enum RoomCommand {
    Signal(SignalingMessage),
    NegotiationTimedOut { peer_id: String, generation: u64 },
    SignalingDisconnected,
    Leave(oneshot::Sender<()>),
}

/// Applies signaling messages and timer expiries to the peer registry, strictly one at a time.
pub(crate) struct RoomController<ST: SignalingTransport> {
    channel: SignalingChannel<ST>,
    registry: Arc<PeerRegistry>,
    media: Arc<LocalMediaSource>,
    own_id: Arc<RwLock<Option<String>>>,
    events_tx: broadcast::Sender<RoomEvent>,
    commands_tx: mpsc::UnboundedSender<RoomCommand>,
    negotiation_timeout: Option<Duration>,
}

impl<ST: SignalingTransport> RoomController<ST> {
    pub(crate) fn new(
        channel: SignalingChannel<ST>,
        registry: Arc<PeerRegistry>,
        media: Arc<LocalMediaSource>,
        own_id: Arc<RwLock<Option<String>>>,
        events_tx: broadcast::Sender<RoomEvent>,
        commands_tx: mpsc::UnboundedSender<RoomCommand>,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            channel,
            registry,
            media,
            own_id,
            events_tx,
            commands_tx,
            negotiation_timeout,
        }
    }

    pub(crate) async fn run(self, mut commands_rx: mpsc::UnboundedReceiver<RoomCommand>) {
        tracing::debug!("Starting room controller");
        while let Some(command) = commands_rx.recv().await {
            match command {
                RoomCommand::Signal(msg) => self.handle_message(msg).await,
                RoomCommand::NegotiationTimedOut {
                    peer_id,
                    generation,
                } => self.handle_negotiation_timeout(&peer_id, generation).await,
                RoomCommand::SignalingDisconnected => {
                    tracing::warn!("Lost connection to signaling relay");
                    self.emit(RoomEvent::SignalingDisconnected);
                }
                RoomCommand::Leave(done) => {
                    self.registry.close_all().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        tracing::debug!("Room controller stopped");
    }

    fn emit(&self, event: RoomEvent) {
        if let Err(err) = self.events_tx.send(event) {
            tracing::trace!(?err, "No room event subscribers");
        }
    }

    #[instrument(level = "debug", skip(self, msg), fields(kind = %msg.kind(), peer_id = ?msg.peer_id()))]
    async fn handle_message(&self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::RoomJoined { room_id, peer_id } => {
                tracing::info!(?room_id, own_id = ?peer_id, "Room join acknowledged");
                *self.own_id.write() = Some(peer_id.clone());
                self.emit(RoomEvent::Joined {
                    room_id,
                    own_id: peer_id,
                });
            }
            SignalingMessage::UserJoined { peer_id } => self.handle_user_joined(peer_id).await,
            SignalingMessage::Offer { sdp, peer_id } => self.handle_offer(peer_id, &sdp).await,
            SignalingMessage::Answer { sdp, peer_id } => self.handle_answer(&peer_id, &sdp).await,
            SignalingMessage::IceCandidate { candidate, peer_id } => {
                self.handle_ice_candidate(&peer_id, candidate.as_deref())
                    .await;
            }
            SignalingMessage::UserLeft { peer_id } => {
                if self.registry.remove(&peer_id).await.is_some() {
                    tracing::info!("Peer left the room");
                    self.emit(RoomEvent::PeerLeft { peer_id });
                } else {
                    tracing::debug!("Unknown peer left the room");
                }
            }
            SignalingMessage::PeerNotFound { peer_id } => {
                tracing::warn!(?peer_id, "Relay could not deliver message to peer");
            }
            SignalingMessage::Error { reason, peer_id } => {
                tracing::warn!(?reason, ?peer_id, "Received error from relay");
            }
            other => {
                tracing::trace!(kind = %other.kind(), "Ignoring signaling message");
            }
        }
    }

    fn is_own_id(&self, peer_id: &str) -> bool {
        self.own_id.read().as_deref() == Some(peer_id)
    }

    /// Existing members call every newcomer.
    async fn handle_user_joined(&self, peer_id: String) {
        if self.is_own_id(&peer_id) {
            tracing::debug!("Ignoring own join announcement");
            return;
        }
        let session = match self.registry.get_or_create(&peer_id).await {
            Ok((session, true)) => {
                self.emit(RoomEvent::PeerJoined { peer_id });
                session
            }
            Ok((_, false)) => {
                tracing::debug!("Session for peer exists already, not offering again");
                return;
            }
            Err(err) => {
                self.emit(RoomEvent::NegotiationFailed {
                    peer_id,
                    reason: err.to_string(),
                });
                return;
            }
        };

        peer_events::spawn(
            Arc::clone(&session),
            self.channel.clone(),
            self.events_tx.clone(),
        );
        if let Err(err) = self.offer(&session).await {
            self.fail_session(&session, err).await;
        }
    }

    async fn attach_local_tracks(&self, session: &PeerSession) -> Result<(), Error> {
        session
            .attach_local_tracks(&self.media.local_tracks())
            .await?;
        // A camera switch may have installed a new video track while the first set was attached,
        // before this session had a sender to replace.
        session
            .attach_local_tracks(&self.media.local_tracks())
            .await?;
        Ok(())
    }

    async fn offer(&self, session: &Arc<PeerSession>) -> Result<(), Error> {
        self.attach_local_tracks(session).await?;
        let Some(sdp) = session.start_offer().await? else {
            tracing::debug!("Session closed while creating offer");
            return Ok(());
        };
        if !self.registry.is_current(session) {
            tracing::debug!("Session replaced while creating offer, dropping it");
            return Ok(());
        }

        self.send(SignalingMessage::Offer {
            sdp,
            peer_id: session.peer_id().to_string(),
        })
        .await;
        session.mark_local_description_sent();
        self.arm_negotiation_timeout(session);
        Ok(())
    }

    fn arm_negotiation_timeout(&self, session: &Arc<PeerSession>) {
        let Some(timeout) = self.negotiation_timeout else {
            return;
        };

        let session = Arc::clone(session);
        let commands_tx = self.commands_tx.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = session.closed() => {}
                    _ = tokio::time::sleep(timeout) => {
                        let _ = commands_tx.send(RoomCommand::NegotiationTimedOut {
                            peer_id: session.peer_id().to_string(),
                            generation: session.generation(),
                        });
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    /// A received offer always starts a fresh session, closing any previous one for that peer.
    async fn handle_offer(&self, peer_id: String, sdp: &str) {
        let known = self.registry.get(&peer_id).is_some();
        let session = match self.registry.replace(&peer_id).await {
            Ok(session) => {
                if !known {
                    self.emit(RoomEvent::PeerJoined { peer_id });
                }
                session
            }
            Err(err) => {
                self.emit(RoomEvent::NegotiationFailed {
                    peer_id,
                    reason: err.to_string(),
                });
                return;
            }
        };

        peer_events::spawn(
            Arc::clone(&session),
            self.channel.clone(),
            self.events_tx.clone(),
        );
        if let Err(err) = self.answer(&session, sdp).await {
            self.fail_session(&session, err).await;
        }
    }

    async fn answer(&self, session: &Arc<PeerSession>, sdp: &str) -> Result<(), Error> {
        self.attach_local_tracks(session).await?;
        let Some(answer) = session.accept_offer(sdp).await? else {
            tracing::debug!("Session closed while creating answer");
            return Ok(());
        };
        if !self.registry.is_current(session) {
            tracing::debug!("Session replaced while creating answer, dropping it");
            return Ok(());
        }

        self.send(SignalingMessage::Answer {
            sdp: answer,
            peer_id: session.peer_id().to_string(),
        })
        .await;
        session.mark_local_description_sent();
        Ok(())
    }

    async fn handle_answer(&self, peer_id: &str, sdp: &str) {
        let Some(session) = self.registry.get(peer_id) else {
            tracing::debug!("No session for peer, dropping answer");
            return;
        };

        match session.accept_answer(sdp).await {
            Ok(AnswerOutcome::Applied) => tracing::debug!("Answer applied"),
            Ok(outcome) => tracing::debug!(?outcome, "Answer not applied"),
            Err(err) => self.fail_session(&session, err.into()).await,
        }
    }

    /// Candidates for unknown peers are dropped rather than buffered.
    async fn handle_ice_candidate(&self, peer_id: &str, candidate: Option<&str>) {
        let Some(session) = self.registry.get(peer_id) else {
            tracing::debug!("No session for peer, dropping ICE candidate");
            return;
        };

        if let Err(err) = session.add_remote_candidate(candidate).await {
            tracing::warn!(?err, "Failed to add remote ICE candidate");
        }
    }

    async fn handle_negotiation_timeout(&self, peer_id: &str, generation: u64) {
        let Some(session) = self.registry.get(peer_id) else {
            return;
        };
        if session.generation() != generation || session.state() != SignalingState::HaveLocalOffer
        {
            tracing::trace!(?peer_id, "Negotiation completed before timeout");
            return;
        }

        tracing::warn!(?peer_id, "Offer not answered in time, giving up on peer");
        if self.registry.remove_session(&session).await {
            self.emit(RoomEvent::PeerUnreachable {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Discards a session whose negotiation failed. Other sessions are not affected.
    async fn fail_session(&self, session: &Arc<PeerSession>, err: Error) {
        tracing::warn!(peer_id = ?session.peer_id(), ?err, "Negotiation failed");
        if self.registry.remove_session(session).await {
            self.emit(RoomEvent::NegotiationFailed {
                peer_id: session.peer_id().to_string(),
                reason: err.to_string(),
            });
        }
    }

    async fn send(&self, msg: SignalingMessage) {
        if let Err(err) = self.channel.send(msg).await {
            tracing::warn!(?err, "Failed to send signaling message");
        }
    }
}

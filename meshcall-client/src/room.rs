mod controller;
mod peer_events;

use crate::config::AppConfig;
use crate::error::Error;
use controller::{RoomCommand, RoomController};
use meshcall_media::{
    CaptureBackend, DEFAULT_SWITCH_GRACE, FacingMode, LocalMediaSource, MediaConstraints,
};
use meshcall_protocol::ice::IceConfig;
use meshcall_signaling::channel::{ListenerId, SignalingChannel, State};
use meshcall_signaling::protocol::ws::MessageKind;
use meshcall_signaling::transport::SignalingTransport;
use meshcall_webrtc::{ConnectionState, PeerRegistry, PeerSession, RemoteStream, RtcEngine};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const ROOM_EVENTS_CAPACITY: usize = 128;

/// Signaling messages a room reacts to.
const HANDLED_KINDS: [MessageKind; 8] = [
    MessageKind::RoomJoined,
    MessageKind::UserJoined,
    MessageKind::Offer,
    MessageKind::Answer,
    MessageKind::IceCandidate,
    MessageKind::UserLeft,
    MessageKind::PeerNotFound,
    MessageKind::Error,
];

#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub room_id: String,
    pub ice: IceConfig,
    pub constraints: MediaConstraints,
    pub switch_grace: Duration,
    /// Offers left unanswered for this long are abandoned. Disabled if `None`.
    pub negotiation_timeout: Option<Duration>,
}

impl RoomOptions {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ice: IceConfig::default(),
            constraints: MediaConstraints::default(),
            switch_grace: DEFAULT_SWITCH_GRACE,
            negotiation_timeout: None,
        }
    }

    pub fn from_config(room_id: impl Into<String>, config: &AppConfig) -> Self {
        Self {
            room_id: room_id.into(),
            ice: config.ice.clone(),
            constraints: MediaConstraints {
                facing_mode: config.media.facing_mode,
                ..Default::default()
            },
            switch_grace: config.media.switch_grace(),
            negotiation_timeout: config.negotiation.timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The relay acknowledged the join and assigned the local connection ID.
    Joined {
        room_id: String,
        own_id: String,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    RemoteStreamAdded {
        peer_id: String,
        stream: Arc<RemoteStream>,
    },
    RemoteStreamReplaced {
        peer_id: String,
        previous_stream_id: String,
        stream: Arc<RemoteStream>,
    },
    RemoteTrackEnded {
        peer_id: String,
        track_id: String,
        video_muted: bool,
    },
    PeerConnectionState {
        peer_id: String,
        state: ConnectionState,
    },
    /// An offer stayed unanswered past the negotiation timeout.
    PeerUnreachable {
        peer_id: String,
    },
    /// Negotiation with the peer failed, its session was discarded.
    NegotiationFailed {
        peer_id: String,
        reason: String,
    },
    SignalingDisconnected,
    Left,
}

impl RoomEvent {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            RoomEvent::PeerJoined { peer_id }
            | RoomEvent::PeerLeft { peer_id }
            | RoomEvent::RemoteStreamAdded { peer_id, .. }
            | RoomEvent::RemoteStreamReplaced { peer_id, .. }
            | RoomEvent::RemoteTrackEnded { peer_id, .. }
            | RoomEvent::PeerConnectionState { peer_id, .. }
            | RoomEvent::PeerUnreachable { peer_id }
            | RoomEvent::NegotiationFailed { peer_id, .. } => Some(peer_id),
            RoomEvent::Joined { .. } | RoomEvent::SignalingDisconnected | RoomEvent::Left => None,
        }
    }
}

/// Membership of the local participant in one mesh call.
///
/// Owns the local media, the signaling channel and one peer session per remote participant. All
/// signaling messages are processed one at a time, in arrival order, by a single controller task.
pub struct Room<ST: SignalingTransport> {
    room_id: String,
    channel: SignalingChannel<ST>,
    registry: Arc<PeerRegistry>,
    media: Arc<LocalMediaSource>,
    own_id: Arc<RwLock<Option<String>>>,
    events_tx: broadcast::Sender<RoomEvent>,
    commands_tx: mpsc::UnboundedSender<RoomCommand>,
    listener_ids: Mutex<Vec<ListenerId>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    leave_token: CancellationToken,
    shutdown_token: CancellationToken,
}

impl<ST: SignalingTransport> Room<ST> {
    /// Acquires local media, connects to the relay and joins the room.
    ///
    /// Nothing is left running if any step fails.
    #[instrument(level = "info", skip_all, fields(room_id = %options.room_id), err)]
    pub async fn join(
        transport: ST,
        engine: Arc<dyn RtcEngine>,
        backend: Arc<dyn CaptureBackend>,
        options: RoomOptions,
    ) -> Result<Self, Error> {
        let media =
            LocalMediaSource::acquire(backend, options.constraints, options.switch_grace).await?;

        let shutdown_token = CancellationToken::new();
        let channel = SignalingChannel::new(transport, shutdown_token.child_token());
        if let Err(err) = channel.connect().await {
            media.stop();
            return Err(err.into());
        }

        let registry = Arc::new(PeerRegistry::new(engine, options.ice));
        let own_id = Arc::new(RwLock::new(None));
        let (events_tx, _) = broadcast::channel(ROOM_EVENTS_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let listener_ids = HANDLED_KINDS
            .into_iter()
            .map(|kind| {
                let commands_tx = commands_tx.clone();
                channel.on_message(kind, move |msg| {
                    let commands_tx = commands_tx.clone();
                    async move {
                        if commands_tx.send(RoomCommand::Signal(msg)).is_err() {
                            tracing::trace!("Room controller gone, dropping signaling message");
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let leave_token = CancellationToken::new();
        let controller = RoomController::new(
            channel.clone(),
            Arc::clone(&registry),
            Arc::clone(&media),
            Arc::clone(&own_id),
            events_tx.clone(),
            commands_tx.clone(),
            options.negotiation_timeout,
        );
        let controller = tokio::spawn(
            controller
                .run(commands_rx)
                .instrument(tracing::Span::current()),
        );
        Self::watch_signaling_state(&channel, commands_tx.clone(), leave_token.clone());

        let room = Self {
            room_id: options.room_id,
            channel,
            registry,
            media,
            own_id,
            events_tx,
            commands_tx,
            listener_ids: Mutex::new(listener_ids),
            controller: Mutex::new(Some(controller)),
            leave_token,
            shutdown_token,
        };

        if let Err(err) = room.channel.join(&room.room_id).await {
            room.leave().await;
            return Err(err.into());
        }

        tracing::info!("Joined room");
        Ok(room)
    }

    fn watch_signaling_state(
        channel: &SignalingChannel<ST>,
        commands_tx: mpsc::UnboundedSender<RoomCommand>,
        leave_token: CancellationToken,
    ) {
        let mut state_rx = channel.subscribe_state();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = leave_token.cancelled() => break,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            if *state_rx.borrow_and_update() == State::Disconnected {
                                let _ = commands_tx.send(RoomCommand::SignalingDisconnected);
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Connection ID assigned by the relay, known once the join was acknowledged.
    pub fn own_id(&self) -> Option<String> {
        self.own_id.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }

    pub fn media(&self) -> &Arc<LocalMediaSource> {
        &self.media
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> &SignalingChannel<ST> {
        &self.channel
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.registry.peer_ids()
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.registry.get(peer_id)
    }

    pub fn is_left(&self) -> bool {
        self.leave_token.is_cancelled()
    }

    /// Toggles the local audio track. Peers keep receiving the track, no renegotiation happens.
    pub fn set_muted(&self, muted: bool) -> Result<(), Error> {
        if self.is_left() {
            return Err(Error::RoomClosed);
        }
        self.media.set_muted(muted);
        Ok(())
    }

    pub fn set_camera_off(&self, off: bool) -> Result<(), Error> {
        if self.is_left() {
            return Err(Error::RoomClosed);
        }
        self.media.set_camera_off(off);
        Ok(())
    }

    /// Switches the camera and swaps the outgoing video in every peer session without renegotiating.
    pub async fn switch_camera(&self, requested: Option<FacingMode>) -> Result<FacingMode, Error> {
        if self.is_left() {
            return Err(Error::RoomClosed);
        }
        Ok(self
            .media
            .switch_camera(requested, self.registry.as_ref())
            .await?)
    }

    /// Recovers local video after a failed camera switch.
    pub async fn reacquire_video(&self) -> Result<(), Error> {
        if self.is_left() {
            return Err(Error::RoomClosed);
        }
        Ok(self.media.reacquire_video(self.registry.as_ref()).await?)
    }

    /// Leaves the room: stops reacting to signaling, announces the departure, closes every peer
    /// session and stops local media. Calling it again does nothing.
    #[instrument(level = "info", skip(self), fields(room_id = %self.room_id))]
    pub async fn leave(&self) {
        if self.leave_token.is_cancelled() {
            tracing::debug!("Room already left");
            return;
        }
        self.leave_token.cancel();

        for id in self.listener_ids.lock().drain(..) {
            self.channel.remove_listener(id);
        }
        self.channel.disconnect().await;

        let controller = self.controller.lock().take();
        if let Some(controller) = controller {
            let (done_tx, done_rx) = oneshot::channel();
            if self.commands_tx.send(RoomCommand::Leave(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
            if let Err(err) = controller.await {
                tracing::warn!(?err, "Failed to join room controller");
            }
        }
        // Sessions created after the controller stopped, if any.
        self.registry.close_all().await;

        self.media.stop();
        self.shutdown_token.cancel();
        let _ = self.events_tx.send(RoomEvent::Left);
        tracing::info!("Left room");
    }
}

impl<ST: SignalingTransport> Drop for Room<ST> {
    fn drop(&mut self) {
        self.leave_token.cancel();
        self.shutdown_token.cancel();
        if let Some(controller) = self.controller.lock().take() {
            controller.abort();
        }
        self.media.stop();
    }
}

use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use meshcall_protocol::ws::{ErrorReason, SignalingMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

struct RelayClient {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    room_id: Option<String>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    clients: BTreeMap<String, RelayClient>,
    delivered: HashMap<String, usize>,
}

/// In-process signaling relay routing messages between [`MockTransport`] connections by room.
///
/// Behaves like the production relay: assigns connection IDs, broadcasts joins and departures to the
/// other members of a room and rewrites the `peer_id` of addressed messages from target to source.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            relay: self.clone(),
        }
    }

    /// Delivers a message to a connected client as if the relay had forwarded it.
    pub fn inject(&self, to: &str, msg: SignalingMessage) -> bool {
        let state = self.state.lock();
        match state.clients.get(to) {
            Some(client) => client.tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().clients.keys().cloned().collect()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.state
            .lock()
            .clients
            .iter()
            .filter(|(_, client)| client.room_id.as_deref() == Some(room_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of peer-to-peer messages the relay delivered to the given client.
    pub fn delivered_to(&self, peer_id: &str) -> usize {
        self.state
            .lock()
            .delivered
            .get(peer_id)
            .copied()
            .unwrap_or_default()
    }

    fn register(&self) -> (String, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = format!("peer{}", state.next_id);
        state.next_id += 1;
        state.clients.insert(id.clone(), RelayClient { tx, room_id: None });
        tracing::trace!(peer_id = ?id, "Registered mock relay client");
        (id, rx)
    }

    #[tracing::instrument(level = "trace", skip(self, msg), fields(kind = %msg.kind()))]
    fn route(&self, from: &str, msg: SignalingMessage) {
        let mut state = self.state.lock();
        match msg {
            SignalingMessage::JoinRoom { room_id } => {
                Self::leave_room(&mut state, from);
                if let Some(client) = state.clients.get_mut(from) {
                    client.room_id = Some(room_id.clone());
                    let _ = client.tx.send(SignalingMessage::RoomJoined {
                        room_id: room_id.clone(),
                        peer_id: from.to_string(),
                    });
                }
                Self::broadcast(
                    &state,
                    &room_id,
                    from,
                    SignalingMessage::UserJoined {
                        peer_id: from.to_string(),
                    },
                );
            }
            SignalingMessage::LeaveRoom => Self::leave_room(&mut state, from),
            msg @ (SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::IceCandidate { .. }) => {
                let to = msg.peer_id().unwrap_or_default().to_string();
                let room_id = state.clients.get(from).and_then(|c| c.room_id.clone());
                let target = state
                    .clients
                    .get(&to)
                    .filter(|c| room_id.is_some() && c.room_id == room_id);
                let delivered = match (target, msg.with_peer_id(from)) {
                    (Some(target), Some(forwarded)) => target.tx.send(forwarded).is_ok(),
                    _ => false,
                };
                if delivered {
                    *state.delivered.entry(to).or_default() += 1;
                } else if let Some(client) = state.clients.get(from) {
                    tracing::debug!(peer_id = ?to, "Peer not found");
                    let _ = client
                        .tx
                        .send(SignalingMessage::PeerNotFound { peer_id: to });
                }
            }
            other => {
                if let Some(client) = state.clients.get(from) {
                    let _ = client.tx.send(SignalingMessage::Error {
                        reason: ErrorReason::UnexpectedMessage(other.kind().to_string()),
                        peer_id: None,
                    });
                }
            }
        }
    }

    fn disconnect(&self, id: &str) {
        let mut state = self.state.lock();
        Self::leave_room(&mut state, id);
        state.clients.remove(id);
        tracing::trace!(peer_id = ?id, "Unregistered mock relay client");
    }

    fn leave_room(state: &mut RelayState, id: &str) {
        let Some(room_id) = state.clients.get_mut(id).and_then(|c| c.room_id.take()) else {
            return;
        };
        Self::broadcast(
            state,
            &room_id,
            id,
            SignalingMessage::UserLeft {
                peer_id: id.to_string(),
            },
        );
    }

    fn broadcast(state: &RelayState, room_id: &str, except: &str, msg: SignalingMessage) {
        for (id, client) in &state.clients {
            if id != except && client.room_id.as_deref() == Some(room_id) {
                let _ = client.tx.send(msg.clone());
            }
        }
    }
}

pub struct MockTransport {
    relay: MockRelay,
}

pub struct MockSender {
    relay: MockRelay,
    id: String,
    closed: bool,
}

pub struct MockReceiver {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl MockSender {
    pub fn peer_id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        let (id, rx) = self.relay.register();
        Ok((
            MockSender {
                relay: self.relay.clone(),
                id,
                closed: false,
            },
            MockReceiver { rx },
        ))
    }
}

#[async_trait]
impl SignalingSender for MockSender {
    #[tracing::instrument(level = "debug", skip(self, msg), fields(kind = %msg.kind()))]
    async fn send(&mut self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::SendFailure("Sender closed".to_string()));
        }
        self.relay.route(&self.id, msg);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn close(&mut self) -> Result<(), SignalingError> {
        tracing::debug!("Closing MockSender");
        if !self.closed {
            self.closed = true;
            self.relay.disconnect(&self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn recv(&mut self) -> Result<SignalingMessage, SignalingError> {
        match self.rx.recv().await {
            Some(msg) => {
                tracing::trace!(?msg, "Received message");
                Ok(msg)
            }
            None => {
                tracing::warn!("Channel closed");
                Err(SignalingError::Disconnected)
            }
        }
    }
}

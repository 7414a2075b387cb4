use crate::channel::SignalingChannel;
use crate::test_utils::RecvWithTimeoutExt;
use crate::transport::mock::{MockRelay, MockTransport};
use meshcall_protocol::ws::{MessageKind, SignalingMessage};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const ALL_KINDS: [MessageKind; 10] = [
    MessageKind::JoinRoom,
    MessageKind::RoomJoined,
    MessageKind::LeaveRoom,
    MessageKind::UserJoined,
    MessageKind::Offer,
    MessageKind::Answer,
    MessageKind::IceCandidate,
    MessageKind::UserLeft,
    MessageKind::PeerNotFound,
    MessageKind::Error,
];

pub struct TestRigClient {
    pub channel: SignalingChannel<MockTransport>,
    pub messages_rx: broadcast::Receiver<SignalingMessage>,
}

impl TestRigClient {
    pub async fn send(&self, msg: SignalingMessage) -> anyhow::Result<()> {
        Ok(self.channel.send(msg).await?)
    }

    pub async fn recv_with_timeout(&mut self, timeout: Duration) -> Option<SignalingMessage> {
        match tokio::time::timeout(timeout, self.messages_rx.recv()).await {
            Ok(Ok(msg)) => Some(msg),
            _ => None,
        }
    }

    pub async fn recv_kind_with_timeout(
        &mut self,
        timeout: Duration,
        kind: MessageKind,
    ) -> Option<SignalingMessage> {
        self.messages_rx
            .recv_with_timeout(timeout, |msg| msg.kind() == kind)
            .await
            .ok()
    }
}

/// A [`MockRelay`] with a number of connected channels, all joined to the same room.
///
/// Every message received by a client is mirrored into its `messages_rx`, in delivery order.
pub struct TestRig {
    relay: MockRelay,
    clients: Vec<TestRigClient>,
    shutdown_token: CancellationToken,
}

impl TestRig {
    pub async fn new(num_clients: usize, room_id: &str) -> anyhow::Result<Self> {
        let relay = MockRelay::new();
        let shutdown_token = CancellationToken::new();

        let mut clients = Vec::with_capacity(num_clients);
        for _ in 0..num_clients {
            let channel = SignalingChannel::new(relay.transport(), shutdown_token.child_token());
            let (messages_tx, messages_rx) = broadcast::channel(64);
            for kind in ALL_KINDS {
                let messages_tx = messages_tx.clone();
                channel.on_message(kind, move |msg| {
                    let messages_tx = messages_tx.clone();
                    async move {
                        let _ = messages_tx.send(msg);
                    }
                });
            }

            channel.connect().await?;
            channel.join(room_id).await?;

            let mut client = TestRigClient {
                channel,
                messages_rx,
            };
            client
                .recv_kind_with_timeout(Duration::from_millis(100), MessageKind::RoomJoined)
                .await
                .ok_or_else(|| anyhow::anyhow!("Client did not receive RoomJoined"))?;
            clients.push(client);
        }

        // Drain the UserJoined announcements of later clients.
        for client in clients.iter_mut() {
            while client
                .recv_with_timeout(Duration::from_millis(10))
                .await
                .is_some()
            {}
        }

        Ok(Self {
            relay,
            clients,
            shutdown_token,
        })
    }

    pub fn relay(&self) -> &MockRelay {
        &self.relay
    }

    pub fn client(&self, index: usize) -> &TestRigClient {
        &self.clients[index]
    }

    pub fn client_mut(&mut self, index: usize) -> &mut TestRigClient {
        &mut self.clients[index]
    }

    pub fn clients_mut(&mut self) -> &mut [TestRigClient] {
        &mut self.clients
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        self.shutdown();
    }
}

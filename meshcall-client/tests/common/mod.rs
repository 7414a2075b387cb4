#![allow(dead_code)]

use meshcall_client::room::{Room, RoomEvent, RoomOptions};
use meshcall_media::synthetic::SyntheticBackend;
use meshcall_signaling::test_utils::RecvWithTimeoutExt;
use meshcall_signaling::transport::mock::{MockRelay, MockTransport};
use meshcall_webrtc::SignalingState;
use meshcall_webrtc::mock::{MOCK_CANDIDATES_PER_DESCRIPTION, MockEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const ROOM_ID: &str = "room1";
pub const TIMEOUT: Duration = Duration::from_secs(2);

pub struct Participant {
    pub room: Room<MockTransport>,
    pub engine: MockEngine,
    pub backend: SyntheticBackend,
    pub events: broadcast::Receiver<RoomEvent>,
}

impl Participant {
    pub async fn join(relay: &MockRelay) -> Self {
        Self::join_with(relay, MockEngine::new(), SyntheticBackend::new(), options()).await
    }

    pub async fn join_with(
        relay: &MockRelay,
        engine: MockEngine,
        backend: SyntheticBackend,
        options: RoomOptions,
    ) -> Self {
        let room = Room::join(
            relay.transport(),
            Arc::new(engine.clone()),
            Arc::new(backend.clone()),
            options,
        )
        .await
        .unwrap();
        let events = room.subscribe();

        let participant = Self {
            room,
            engine,
            backend,
            events,
        };
        wait_until(|| participant.room.own_id().is_some()).await;
        participant
    }

    pub fn id(&self) -> String {
        self.room.own_id().unwrap()
    }

    pub async fn wait_for<F>(&mut self, predicate: F) -> RoomEvent
    where
        F: Fn(&RoomEvent) -> bool + Send,
    {
        self.events.recv_with_timeout(TIMEOUT, predicate).await.unwrap()
    }

    pub fn is_stable_with(&self, peer_id: &str) -> bool {
        self.room
            .session(peer_id)
            .is_some_and(|session| session.state() == SignalingState::Stable)
    }

    /// Whether every open connection received all candidates of its remote side.
    pub fn candidates_exchanged(&self) -> bool {
        self.engine
            .connections()
            .iter()
            .filter(|c| !c.is_closed())
            .all(|c| c.applied_candidates().len() == MOCK_CANDIDATES_PER_DESCRIPTION)
    }
}

pub fn options() -> RoomOptions {
    RoomOptions {
        switch_grace: Duration::ZERO,
        ..RoomOptions::new(ROOM_ID)
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Joins two participants and waits until their connection is fully negotiated.
pub async fn connected_pair(relay: &MockRelay) -> (Participant, Participant) {
    let alice = Participant::join(relay).await;
    let bob = Participant::join(relay).await;
    let (alice_id, bob_id) = (alice.id(), bob.id());

    wait_until(|| {
        alice.is_stable_with(&bob_id)
            && bob.is_stable_with(&alice_id)
            && alice.candidates_exchanged()
            && bob.candidates_exchanged()
    })
    .await;
    (alice, bob)
}

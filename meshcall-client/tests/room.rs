mod common;

use common::{Participant, ROOM_ID, connected_pair, options, wait_until};
use meshcall_client::error::{Error, UserFacingError};
use meshcall_client::room::{Room, RoomEvent, RoomOptions};
use meshcall_media::synthetic::SyntheticBackend;
use meshcall_media::{FacingMode, TrackKind};
use meshcall_signaling::protocol::ws::SignalingMessage;
use meshcall_signaling::transport::mock::MockRelay;
use meshcall_webrtc::mock::{MockEngine, MockOp};
use meshcall_webrtc::{ConnectionState, SignalingState};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

const SETTLE: Duration = Duration::from_millis(50);

#[test(tokio::test)]
async fn two_party_negotiation() {
    let relay = MockRelay::new();
    let mut alice = Participant::join(&relay).await;
    let mut bob = Participant::join(&relay).await;
    assert_eq!(alice.id(), "peer0");
    assert_eq!(bob.id(), "peer1");

    let event = alice
        .wait_for(|e| matches!(e, RoomEvent::RemoteStreamAdded { peer_id, .. } if peer_id == "peer1"))
        .await;
    let RoomEvent::RemoteStreamAdded { stream, .. } = event else {
        unreachable!()
    };
    assert_eq!(stream.stream_id(), bob.engine.stream_id());
    assert_eq!(stream.tracks().len(), 2);

    bob.wait_for(|e| matches!(e, RoomEvent::RemoteStreamAdded { peer_id, .. } if peer_id == "peer0"))
        .await;
    alice
        .wait_for(|e| {
            matches!(e, RoomEvent::PeerConnectionState { peer_id, state: ConnectionState::Connected } if peer_id == "peer1")
        })
        .await;

    wait_until(|| alice.candidates_exchanged() && bob.candidates_exchanged()).await;
    assert!(alice.is_stable_with("peer1"));
    assert!(bob.is_stable_with("peer0"));
    assert_eq!(
        alice.engine.connections()[0].applied_candidates(),
        vec!["candidate:0:0", "candidate:0:1"]
    );

    // Both local tracks are sent to the peer.
    let sender_tracks = alice.room.session("peer1").unwrap().connection().sender_tracks();
    let local_ids = alice
        .room
        .media()
        .local_tracks()
        .iter()
        .map(|t| t.id().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        sender_tracks.into_iter().map(|(_, id)| id).collect::<Vec<_>>(),
        local_ids
    );

    bob.room.leave().await;
    alice
        .wait_for(|e| matches!(e, RoomEvent::PeerLeft { peer_id } if peer_id == "peer1"))
        .await;
    assert!(alice.room.registry().is_empty());
    assert_eq!(alice.engine.open_connections(), 0);
    assert_eq!(bob.engine.open_connections(), 0);
    assert_eq!(relay.client_ids(), vec!["peer0"]);
}

#[test(tokio::test)]
async fn three_party_mesh() {
    let relay = MockRelay::new();
    let participants = vec![
        Participant::join(&relay).await,
        Participant::join(&relay).await,
        Participant::join(&relay).await,
    ];

    wait_until(|| {
        participants.iter().all(|p| {
            let others = participants
                .iter()
                .map(Participant::id)
                .filter(|id| *id != p.id())
                .collect::<Vec<_>>();
            p.room.peer_ids() == others && others.iter().all(|id| p.is_stable_with(id))
        })
    })
    .await;
    tokio::time::sleep(SETTLE).await;

    // Exactly one negotiation per pair.
    for participant in &participants {
        assert_eq!(participant.engine.connections().len(), 2);
        assert_eq!(participant.engine.open_connections(), 2);
    }
    assert_eq!(
        relay.room_members(ROOM_ID).len(),
        participants.len()
    );
}

#[test(tokio::test)]
async fn early_ice_candidate_dropped() {
    let relay = MockRelay::new();
    let mut alice = Participant::join(&relay).await;

    // Arrives before any session with the sender exists.
    assert!(relay.inject(
        "peer0",
        SignalingMessage::IceCandidate {
            candidate: Some("candidate:early".to_string()),
            peer_id: "peer1".to_string(),
        },
    ));
    tokio::time::sleep(SETTLE).await;
    assert!(alice.room.registry().is_empty());
    assert!(alice.engine.connections().is_empty());

    let bob = Participant::join(&relay).await;
    alice
        .wait_for(|e| matches!(e, RoomEvent::RemoteStreamAdded { peer_id, .. } if peer_id == "peer1"))
        .await;
    wait_until(|| alice.candidates_exchanged() && bob.candidates_exchanged()).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        alice.engine.connections()[0].applied_candidates(),
        vec!["candidate:0:0", "candidate:0:1"]
    );
}

#[test(tokio::test)]
async fn offer_for_known_peer_replaces_session() {
    let relay = MockRelay::new();
    let (mut alice, bob) = connected_pair(&relay).await;
    let previous = alice.room.session("peer1").unwrap();
    let delivered_to_bob = relay.delivered_to("peer1");

    assert!(relay.inject(
        "peer0",
        SignalingMessage::Offer {
            sdp: "mock-offer:restarted-stream:7".to_string(),
            peer_id: "peer1".to_string(),
        },
    ));

    alice
        .wait_for(|e| {
            matches!(e, RoomEvent::RemoteStreamAdded { peer_id, stream } if peer_id == "peer1" && stream.stream_id() == "restarted-stream")
        })
        .await;
    wait_until(|| alice.is_stable_with("peer1")).await;
    let current = alice.room.session("peer1").unwrap();
    assert_eq!(previous.state(), SignalingState::Closed);
    assert_eq!(current.state(), SignalingState::Stable);
    assert!(current.generation() > previous.generation());
    assert_eq!(alice.room.registry().len(), 1);
    assert_eq!(alice.engine.open_connections(), 1);

    // The unsolicited answer reaches bob, whose session is already stable.
    wait_until(|| relay.delivered_to("peer1") > delivered_to_bob).await;
    tokio::time::sleep(SETTLE).await;
    let bob_session = bob.room.session("peer0").unwrap();
    assert_eq!(bob_session.state(), SignalingState::Stable);
    assert_eq!(bob.engine.connections()[0].remote_description_count(), 1);
    assert_eq!(bob.room.registry().len(), 1);
}

#[test(tokio::test)]
async fn mute_and_camera_off_do_not_renegotiate() {
    let relay = MockRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    tokio::time::sleep(SETTLE).await;
    let delivered = (relay.delivered_to("peer0"), relay.delivered_to("peer1"));

    alice.room.set_muted(true).unwrap();
    alice.room.set_camera_off(true).unwrap();
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        (relay.delivered_to("peer0"), relay.delivered_to("peer1")),
        delivered
    );
    assert!(alice.room.media().is_muted());
    assert!(alice.room.media().is_camera_off());

    let audio = alice.room.media().audio_track().unwrap();
    assert!(!audio.is_enabled());
    assert!(audio.is_live());
    let session = alice.room.session("peer1").unwrap();
    assert!(
        session
            .connection()
            .sender_tracks()
            .contains(&(TrackKind::Audio, audio.id().to_string()))
    );
    assert_eq!(session.state(), SignalingState::Stable);
    assert!(bob.is_stable_with("peer0"));

    alice.room.set_muted(false).unwrap();
    assert!(audio.is_enabled());
}

#[test(tokio::test)]
async fn registry_tracks_membership() {
    let relay = MockRelay::new();
    let alice = Participant::join(&relay).await;
    let bob = Participant::join(&relay).await;
    let carol = Participant::join(&relay).await;
    let dave = Participant::join(&relay).await;

    wait_until(|| {
        ["peer1", "peer2", "peer3"]
            .iter()
            .all(|id| alice.is_stable_with(id))
    })
    .await;

    carol.room.leave().await;
    wait_until(|| alice.room.peer_ids() == vec!["peer1", "peer3"]).await;
    wait_until(|| bob.room.peer_ids() == vec!["peer0", "peer3"]).await;
    wait_until(|| dave.room.peer_ids() == vec!["peer0", "peer1"]).await;

    assert_eq!(alice.engine.open_connections(), 2);
    assert_eq!(carol.engine.open_connections(), 0);
    assert!(carol.room.registry().is_empty());
}

#[test(tokio::test)]
async fn unanswered_offer_times_out() {
    let relay = MockRelay::new();
    let mut alice = Participant::join_with(
        &relay,
        MockEngine::new(),
        SyntheticBackend::new(),
        RoomOptions {
            negotiation_timeout: Some(Duration::from_millis(100)),
            ..options()
        },
    )
    .await;

    // Announced by the relay, but never answers.
    assert!(relay.inject(
        "peer0",
        SignalingMessage::UserJoined {
            peer_id: "ghost".to_string(),
        },
    ));
    alice
        .wait_for(|e| matches!(e, RoomEvent::PeerJoined { peer_id } if peer_id == "ghost"))
        .await;
    wait_until(|| {
        alice
            .room
            .session("ghost")
            .is_some_and(|s| s.state() == SignalingState::HaveLocalOffer)
    })
    .await;

    alice
        .wait_for(|e| matches!(e, RoomEvent::PeerUnreachable { peer_id } if peer_id == "ghost"))
        .await;
    assert!(alice.room.registry().is_empty());
    assert_eq!(alice.engine.open_connections(), 0);
}

#[test(tokio::test)]
async fn answered_offer_does_not_time_out() {
    let relay = MockRelay::new();
    let alice = Participant::join_with(
        &relay,
        MockEngine::new(),
        SyntheticBackend::new(),
        RoomOptions {
            negotiation_timeout: Some(Duration::from_millis(50)),
            ..options()
        },
    )
    .await;
    let bob = Participant::join(&relay).await;

    wait_until(|| alice.is_stable_with("peer1") && bob.is_stable_with("peer0")).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(alice.is_stable_with("peer1"));
    assert_eq!(alice.engine.open_connections(), 1);
}

#[test(tokio::test)]
async fn negotiation_failure_is_isolated() {
    let relay = MockRelay::new();
    let mut alice = Participant::join(&relay).await;

    alice.engine.fail_next(MockOp::CreateOffer);
    let _bob = Participant::join(&relay).await;
    alice
        .wait_for(|e| matches!(e, RoomEvent::NegotiationFailed { peer_id, .. } if peer_id == "peer1"))
        .await;
    assert!(alice.room.session("peer1").is_none());
    assert_eq!(alice.engine.open_connections(), 0);

    let carol = Participant::join(&relay).await;
    wait_until(|| alice.is_stable_with("peer2") && carol.is_stable_with("peer0")).await;
    assert_eq!(alice.room.peer_ids(), vec!["peer2"]);
}

#[test(tokio::test)]
async fn camera_switch_replaces_track_without_renegotiation() {
    let relay = MockRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    tokio::time::sleep(SETTLE).await;
    let delivered_to_bob = relay.delivered_to("peer1");
    let previous = alice.room.media().video_track().unwrap();

    let facing_mode = alice.room.switch_camera(None).await.unwrap();
    assert_eq!(facing_mode, FacingMode::Environment);

    let current = alice.room.media().video_track().unwrap();
    assert_ne!(current.id(), previous.id());
    assert!(!previous.is_live());
    assert_eq!(current.device_id(), Some("synthetic-back"));

    let session = alice.room.session("peer1").unwrap();
    let sender_tracks = session.connection().sender_tracks();
    assert!(sender_tracks.contains(&(TrackKind::Video, current.id().to_string())));
    assert_eq!(sender_tracks.len(), 2);

    tokio::time::sleep(SETTLE).await;
    assert_eq!(relay.delivered_to("peer1"), delivered_to_bob);
    assert_eq!(session.state(), SignalingState::Stable);
    assert!(bob.is_stable_with("peer0"));
}

#[test(tokio::test)]
async fn camera_switch_rejected_with_single_camera() {
    let relay = MockRelay::new();
    let alice = Participant::join_with(
        &relay,
        MockEngine::new(),
        SyntheticBackend::single_camera(),
        options(),
    )
    .await;
    let previous = alice.room.media().video_track().unwrap();

    let err = alice.room.switch_camera(None).await.unwrap_err();
    let user_facing = UserFacingError::from(&err);
    assert_eq!(
        user_facing.message(),
        "Only one camera available. Cannot flip."
    );
    assert!(user_facing.is_non_critical());

    let current = alice.room.media().video_track().unwrap();
    assert_eq!(current.id(), previous.id());
    assert!(current.is_live());
}

#[test(tokio::test)]
async fn camera_switch_failure_recovers_with_reacquire() {
    let relay = MockRelay::new();
    let (alice, _bob) = connected_pair(&relay).await;

    alice.backend.fail_next_video_opens(2);
    let err = alice.room.switch_camera(None).await.unwrap_err();
    assert!(matches!(err, Error::Media(_)));
    assert!(UserFacingError::from(&err).remedy().is_some());
    assert!(
        alice
            .room
            .media()
            .video_track()
            .is_none_or(|track| !track.is_live())
    );

    alice.room.reacquire_video().await.unwrap();
    let video = alice.room.media().video_track().unwrap();
    assert!(video.is_live());
    let sender_tracks = alice.room.session("peer1").unwrap().connection().sender_tracks();
    assert!(sender_tracks.contains(&(TrackKind::Video, video.id().to_string())));
}

#[test(tokio::test)]
async fn session_created_during_camera_switch_gets_new_video() {
    let relay = MockRelay::new();
    let alice = Participant::join_with(
        &relay,
        MockEngine::new(),
        SyntheticBackend::new(),
        RoomOptions {
            switch_grace: Duration::from_millis(300),
            ..options()
        },
    )
    .await;

    let (switched, bob) = tokio::join!(alice.room.switch_camera(None), async {
        tokio::time::sleep(SETTLE).await;
        let bob = Participant::join(&relay).await;
        // Bob is called while the previous camera is already stopped.
        wait_until(|| {
            alice
                .room
                .session("peer1")
                .is_some_and(|session| session.connection().sender_tracks().len() == 2)
        })
        .await;
        assert!(!alice.room.media().video_track().unwrap().is_live());
        bob
    });
    assert_eq!(switched.unwrap(), FacingMode::Environment);

    wait_until(|| alice.is_stable_with("peer1") && bob.is_stable_with("peer0")).await;
    let video = alice.room.media().video_track().unwrap();
    assert!(video.is_live());
    let sender_tracks = alice.room.session("peer1").unwrap().connection().sender_tracks();
    assert!(sender_tracks.contains(&(TrackKind::Video, video.id().to_string())));
    assert_eq!(sender_tracks.len(), 2);
}

#[test(tokio::test)]
async fn session_created_after_video_lost_gets_reacquired_video() {
    let relay = MockRelay::new();
    let alice = Participant::join(&relay).await;

    alice.backend.fail_next_video_opens(2);
    alice.room.switch_camera(None).await.unwrap_err();
    let stale = alice.room.media().video_track().unwrap();
    assert!(!stale.is_live());

    let bob = Participant::join(&relay).await;
    wait_until(|| alice.is_stable_with("peer1") && bob.is_stable_with("peer0")).await;
    let session = alice.room.session("peer1").unwrap();
    assert!(
        session
            .connection()
            .sender_tracks()
            .contains(&(TrackKind::Video, stale.id().to_string()))
    );

    alice.room.reacquire_video().await.unwrap();
    let video = alice.room.media().video_track().unwrap();
    assert!(video.is_live());
    let sender_tracks = session.connection().sender_tracks();
    assert!(sender_tracks.contains(&(TrackKind::Video, video.id().to_string())));
    assert_eq!(sender_tracks.len(), 2);
    assert_eq!(session.state(), SignalingState::Stable);
}

#[test(tokio::test)]
async fn membership_events_only_for_registry_changes() {
    let relay = MockRelay::new();
    let (mut alice, _bob) = connected_pair(&relay).await;
    alice.events = alice.room.subscribe();

    for msg in [
        SignalingMessage::UserJoined {
            peer_id: "peer1".to_string(),
        },
        SignalingMessage::UserLeft {
            peer_id: "ghost".to_string(),
        },
        SignalingMessage::UserJoined {
            peer_id: "newcomer".to_string(),
        },
    ] {
        assert!(relay.inject("peer0", msg));
    }

    let event = alice
        .wait_for(|e| matches!(e, RoomEvent::PeerJoined { .. } | RoomEvent::PeerLeft { .. }))
        .await;
    assert!(matches!(event, RoomEvent::PeerJoined { peer_id } if peer_id == "newcomer"));
    assert_eq!(alice.room.peer_ids(), vec!["newcomer", "peer1"]);
}

#[test(tokio::test)]
async fn leave_releases_everything() {
    let relay = MockRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay).await;

    alice.room.leave().await;
    alice.wait_for(|e| matches!(e, RoomEvent::Left)).await;
    bob.wait_for(|e| matches!(e, RoomEvent::PeerLeft { peer_id } if peer_id == "peer0"))
        .await;

    assert!(alice.room.is_left());
    assert!(alice.room.registry().is_empty());
    assert_eq!(alice.engine.open_connections(), 0);
    assert_eq!(alice.backend.live_tracks(TrackKind::Audio), 0);
    assert_eq!(alice.backend.live_tracks(TrackKind::Video), 0);
    assert!(bob.room.registry().is_empty());
    assert_eq!(relay.room_members(ROOM_ID), vec!["peer1"]);

    assert!(matches!(alice.room.set_muted(true), Err(Error::RoomClosed)));
    alice.room.leave().await;
}

#[test(tokio::test)]
async fn unavailable_media_aborts_join() {
    let relay = MockRelay::new();
    let result = Room::join(
        relay.transport(),
        Arc::new(MockEngine::new()),
        Arc::new(SyntheticBackend::new().unavailable()),
        options(),
    )
    .await;

    let Err(err) = result else {
        panic!("join succeeded without media");
    };
    assert!(matches!(err, Error::Media(_)));
    assert!(relay.client_ids().is_empty());
}

use crate::engine::{PeerEvent, RemoteTrack, RtcConnection};
use crate::error::WebrtcError;
use meshcall_media::{LocalTrack, TrackKind};
use parking_lot::{Mutex, RwLock};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl Display for SignalingState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalingState::New => "new",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Stable => "stable",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of applying a received answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// The session is already stable, a retransmitted answer is ignored.
    Duplicate,
    IgnoredClosed,
    /// No offer is outstanding, the answer is ignored.
    StateMismatch(SignalingState),
}

/// The media stream of a remote peer, grouping its tracks by stream ID.
#[derive(Debug)]
pub struct RemoteStream {
    stream_id: String,
    tracks: RwLock<Vec<RemoteTrack>>,
}

impl RemoteStream {
    fn new(track: RemoteTrack) -> Self {
        Self {
            stream_id: track.stream_id.clone(),
            tracks: RwLock::new(vec![track]),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn track(&self, kind: TrackKind) -> Option<RemoteTrack> {
        self.tracks.read().iter().find(|t| t.kind == kind).cloned()
    }

    fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }

    fn remove_track(&self, track_id: &str) -> bool {
        let mut tracks = self.tracks.write();
        let len = tracks.len();
        tracks.retain(|t| t.id != track_id);
        len != tracks.len()
    }
}

#[derive(Debug, Clone)]
pub enum RemoteStreamChange {
    Added(Arc<RemoteStream>),
    /// Another track of the already associated stream arrived.
    Same(Arc<RemoteStream>),
    /// A track of a different stream arrived and took over the association.
    Replaced {
        previous: Arc<RemoteStream>,
        current: Arc<RemoteStream>,
    },
}

/// Negotiation state and RTC connection for exactly one remote peer.
///
/// Every operation suspending on the connection re-checks the state when it resumes: once the
/// session was closed, results are discarded and nothing is sent.
pub struct PeerSession {
    peer_id: String,
    generation: u64,
    connection: Arc<dyn RtcConnection>,
    state: Mutex<SignalingState>,
    remote_stream: RwLock<Option<Arc<RemoteStream>>>,
    events_rx: Mutex<Option<broadcast::Receiver<PeerEvent>>>,
    local_description_sent: watch::Sender<bool>,
    close_token: CancellationToken,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    pub fn new(peer_id: &str, generation: u64, connection: Arc<dyn RtcConnection>) -> Self {
        // Subscribe before any negotiation happens so no early event is missed.
        let events_rx = connection.subscribe();
        Self {
            peer_id: peer_id.to_string(),
            generation,
            connection,
            state: Mutex::new(SignalingState::New),
            remote_stream: RwLock::new(None),
            events_rx: Mutex::new(Some(events_rx)),
            local_description_sent: watch::channel(false).0,
            close_token: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SignalingState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SignalingState::Closed
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    /// Takes the connection event feed. Only one consumer exists per session.
    pub fn take_events(&self) -> Option<broadcast::Receiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    pub async fn closed(&self) {
        self.close_token.cancelled().await;
    }

    /// Marks the local offer or answer as handed to signaling.
    ///
    /// Local candidates must not overtake the description they belong to, so forwarding them waits
    /// for this.
    pub fn mark_local_description_sent(&self) {
        self.local_description_sent.send_replace(true);
    }

    /// Resolves once the local description was sent, or never if the session closes first.
    pub async fn local_description_sent(&self) {
        let mut rx = self.local_description_sent.subscribe();
        // The borrow returned by `wait_for` must not live across an await point.
        let sent = async move { rx.wait_for(|sent| *sent).await.is_ok() };
        tokio::select! {
            sent = sent => if !sent {
                std::future::pending::<()>().await;
            },
            _ = self.close_token.cancelled() => std::future::pending::<()>().await,
        }
    }

    fn transition(&self, from: SignalingState, to: SignalingState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        tracing::trace!(peer_id = ?self.peer_id, %from, %to, "Signaling state transition");
        *state = to;
        true
    }

    /// Attaches local tracks to the connection, each at most once.
    ///
    /// A track of a kind that is already being sent replaces the previous one in place.
    #[instrument(level = "debug", skip(self, tracks), fields(peer_id = %self.peer_id), err)]
    pub async fn attach_local_tracks(
        &self,
        tracks: &[Arc<LocalTrack>],
    ) -> Result<usize, WebrtcError> {
        let mut attached = 0;
        for track in tracks {
            if self.is_closed() {
                return Err(WebrtcError::SessionClosed);
            }

            let senders = self.connection.sender_tracks();
            if senders.iter().any(|(_, id)| id == track.id()) {
                tracing::trace!(track_id = ?track.id(), "Track already attached");
                continue;
            }

            if senders.iter().any(|(kind, _)| *kind == track.kind()) {
                self.connection.replace_track(Arc::clone(track)).await?;
            } else {
                self.connection.add_track(Arc::clone(track)).await?;
            }
            attached += 1;
        }
        Ok(attached)
    }

    /// Caller path: creates and applies a local offer.
    ///
    /// Returns `None` if the session was closed while the offer was being created.
    #[instrument(level = "debug", skip(self), fields(peer_id = %self.peer_id), err)]
    pub async fn start_offer(&self) -> Result<Option<String>, WebrtcError> {
        match self.state() {
            SignalingState::New => {}
            SignalingState::Closed => return Ok(None),
            actual => {
                return Err(WebrtcError::NegotiationStateMismatch {
                    expected: SignalingState::New,
                    actual,
                });
            }
        }

        let sdp = self
            .connection
            .create_offer()
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;
        if self.is_closed() {
            tracing::debug!("Session closed while creating offer");
            return Ok(None);
        }

        self.connection
            .set_local_description(&sdp)
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;

        if !self.transition(SignalingState::New, SignalingState::HaveLocalOffer) {
            tracing::debug!(state = %self.state(), "Session changed while applying offer");
            return Ok(None);
        }
        Ok(Some(sdp))
    }

    /// Callee path: applies a remote offer and creates an answer.
    ///
    /// Returns `None` if the session was closed at any point during the exchange.
    #[instrument(level = "debug", skip(self, sdp), fields(peer_id = %self.peer_id), err)]
    pub async fn accept_offer(&self, sdp: &str) -> Result<Option<String>, WebrtcError> {
        match self.state() {
            SignalingState::New => {}
            SignalingState::Closed => return Ok(None),
            actual => {
                return Err(WebrtcError::NegotiationStateMismatch {
                    expected: SignalingState::New,
                    actual,
                });
            }
        }

        self.connection
            .set_remote_description(sdp)
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;
        if !self.transition(SignalingState::New, SignalingState::HaveRemoteOffer) {
            tracing::debug!("Session closed while applying offer");
            return Ok(None);
        }

        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;
        if self.is_closed() {
            tracing::debug!("Session closed while creating answer");
            return Ok(None);
        }

        self.connection
            .set_local_description(&answer)
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;
        if !self.transition(SignalingState::HaveRemoteOffer, SignalingState::Stable) {
            tracing::debug!("Session closed while applying answer");
            return Ok(None);
        }

        Ok(Some(answer))
    }

    /// Caller path: applies the remote answer to the outstanding offer.
    #[instrument(level = "debug", skip(self, sdp), fields(peer_id = %self.peer_id), err)]
    pub async fn accept_answer(&self, sdp: &str) -> Result<AnswerOutcome, WebrtcError> {
        match self.state() {
            SignalingState::HaveLocalOffer => {}
            SignalingState::Stable => {
                tracing::debug!("Session already stable, ignoring duplicate answer");
                return Ok(AnswerOutcome::Duplicate);
            }
            SignalingState::Closed => {
                tracing::debug!("Session closed, ignoring answer");
                return Ok(AnswerOutcome::IgnoredClosed);
            }
            actual => {
                tracing::warn!(state = %actual, "Received answer without outstanding offer, ignoring");
                return Ok(AnswerOutcome::StateMismatch(actual));
            }
        }

        self.connection
            .set_remote_description(sdp)
            .await
            .map_err(|err| WebrtcError::NegotiationFailure(err.to_string()))?;

        if self.transition(SignalingState::HaveLocalOffer, SignalingState::Stable) {
            Ok(AnswerOutcome::Applied)
        } else if self.is_closed() {
            Ok(AnswerOutcome::IgnoredClosed)
        } else {
            Ok(AnswerOutcome::Duplicate)
        }
    }

    /// Applies a remote candidate. The end-of-candidates marker needs no action.
    #[instrument(level = "trace", skip(self, candidate), fields(peer_id = %self.peer_id), err)]
    pub async fn add_remote_candidate(&self, candidate: Option<&str>) -> Result<bool, WebrtcError> {
        let Some(candidate) = candidate else {
            tracing::trace!("Remote end of candidates");
            return Ok(false);
        };
        if self.is_closed() {
            return Ok(false);
        }
        self.connection.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Replaces the outbound video track in place. Returns whether a video sender was updated.
    pub async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<bool, WebrtcError> {
        if self.is_closed() {
            return Ok(false);
        }
        self.connection.replace_track(track).await
    }

    /// Associates a remote track with this session's remote stream.
    pub fn on_remote_track(&self, track: RemoteTrack) -> RemoteStreamChange {
        let mut remote_stream = self.remote_stream.write();
        match remote_stream.as_ref() {
            Some(stream) if stream.stream_id == track.stream_id => {
                stream.add_track(track);
                RemoteStreamChange::Same(Arc::clone(stream))
            }
            Some(previous) => {
                let previous = Arc::clone(previous);
                let current = Arc::new(RemoteStream::new(track));
                *remote_stream = Some(Arc::clone(&current));
                RemoteStreamChange::Replaced { previous, current }
            }
            None => {
                let stream = Arc::new(RemoteStream::new(track));
                *remote_stream = Some(Arc::clone(&stream));
                RemoteStreamChange::Added(stream)
            }
        }
    }

    pub fn on_remote_track_ended(&self, track_id: &str) -> bool {
        self.remote_stream
            .read()
            .as_ref()
            .is_some_and(|stream| stream.remove_track(track_id))
    }

    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.remote_stream.read().clone()
    }

    /// A remote peer without a live video track is shown as camera-off.
    pub fn remote_video_muted(&self) -> bool {
        self.remote_stream
            .read()
            .as_ref()
            .and_then(|stream| stream.track(TrackKind::Video))
            .is_none()
    }

    /// Closes the session and its connection. Returns `false` if it was already closed.
    #[instrument(level = "debug", skip(self), fields(peer_id = %self.peer_id, generation = self.generation))]
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SignalingState::Closed {
                return false;
            }
            *state = SignalingState::Closed;
        }
        self.close_token.cancel();
        self.remote_stream.write().take();

        if let Err(err) = self.connection.close().await {
            tracing::warn!(?err, "Failed to close peer connection");
        }
        tracing::debug!("Peer session closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RtcEngine;
    use crate::mock::{MockEngine, MockOp};
    use meshcall_media::{TrackCodec, TrackKind};
    use meshcall_protocol::ice::IceConfig;
    use pretty_assertions::assert_eq;
    use test_log::test;

    async fn session(engine: &MockEngine, peer_id: &str) -> Arc<PeerSession> {
        let connection = engine
            .create_connection(&IceConfig::default())
            .await
            .unwrap();
        Arc::new(PeerSession::new(peer_id, 0, connection))
    }

    fn local_tracks() -> Vec<Arc<LocalTrack>> {
        vec![
            LocalTrack::new(TrackKind::Audio, TrackCodec::opus(), None, None),
            LocalTrack::new(TrackKind::Video, TrackCodec::vp8(), None, None),
        ]
    }

    #[test(tokio::test)]
    async fn offer_answer_reaches_stable() {
        let caller_engine = MockEngine::new();
        let callee_engine = MockEngine::new();
        let caller = session(&caller_engine, "callee").await;
        let callee = session(&callee_engine, "caller").await;

        caller.attach_local_tracks(&local_tracks()).await.unwrap();
        callee.attach_local_tracks(&local_tracks()).await.unwrap();

        let offer = caller.start_offer().await.unwrap().unwrap();
        assert_eq!(caller.state(), SignalingState::HaveLocalOffer);

        let answer = callee.accept_offer(&offer).await.unwrap().unwrap();
        assert_eq!(callee.state(), SignalingState::Stable);

        assert_eq!(
            caller.accept_answer(&answer).await.unwrap(),
            AnswerOutcome::Applied
        );
        assert_eq!(caller.state(), SignalingState::Stable);
    }

    #[test(tokio::test)]
    async fn duplicate_answer_is_idempotent() {
        let engine = MockEngine::new();
        let remote = MockEngine::new();
        let caller = session(&engine, "callee").await;
        let callee = session(&remote, "caller").await;

        let offer = caller.start_offer().await.unwrap().unwrap();
        let answer = callee.accept_offer(&offer).await.unwrap().unwrap();

        assert_eq!(
            caller.accept_answer(&answer).await.unwrap(),
            AnswerOutcome::Applied
        );
        assert_eq!(
            caller.accept_answer(&answer).await.unwrap(),
            AnswerOutcome::Duplicate
        );
        assert_eq!(caller.state(), SignalingState::Stable);
        assert_eq!(engine.connections()[0].remote_description_count(), 1);
    }

    #[test(tokio::test)]
    async fn answer_without_offer_ignored() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;

        assert_eq!(
            session.accept_answer("mock-answer:x:0").await.unwrap(),
            AnswerOutcome::StateMismatch(SignalingState::New)
        );
        assert_eq!(session.state(), SignalingState::New);

        session.close().await;
        assert_eq!(
            session.accept_answer("mock-answer:x:0").await.unwrap(),
            AnswerOutcome::IgnoredClosed
        );
    }

    #[test(tokio::test)]
    async fn attach_tracks_idempotent() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;
        let tracks = local_tracks();

        assert_eq!(session.attach_local_tracks(&tracks).await.unwrap(), 2);
        assert_eq!(session.attach_local_tracks(&tracks).await.unwrap(), 0);
        assert_eq!(session.connection().sender_tracks().len(), 2);

        let new_video = LocalTrack::new(TrackKind::Video, TrackCodec::vp8(), None, None);
        assert_eq!(
            session
                .attach_local_tracks(std::slice::from_ref(&new_video))
                .await
                .unwrap(),
            1
        );
        let senders = session.connection().sender_tracks();
        assert_eq!(senders.len(), 2);
        assert!(senders.contains(&(TrackKind::Video, new_video.id().to_string())));
    }

    #[test(tokio::test)]
    async fn close_during_answer_creation_discards_answer() {
        let engine = MockEngine::new();
        let remote = MockEngine::new();
        let caller = session(&remote, "callee").await;
        let callee = session(&engine, "caller").await;
        let offer = caller.start_offer().await.unwrap().unwrap();

        let gate = engine.hold_answers();
        let pending = {
            let callee = Arc::clone(&callee);
            tokio::spawn(async move { callee.accept_offer(&offer).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(callee.state(), SignalingState::HaveRemoteOffer);
        assert!(callee.close().await);
        gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert_eq!(callee.state(), SignalingState::Closed);
        assert_eq!(engine.connections()[0].local_description(), None);
    }

    #[test(tokio::test)]
    async fn failed_offer_is_negotiation_failure() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;

        engine.fail_next(MockOp::CreateOffer);
        assert!(matches!(
            session.start_offer().await,
            Err(WebrtcError::NegotiationFailure(_))
        ));
    }

    #[test(tokio::test)]
    async fn remote_stream_association() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;
        assert!(session.remote_video_muted());

        let audio = RemoteTrack::new("a", "stream1", TrackKind::Audio);
        let video = RemoteTrack::new("v", "stream1", TrackKind::Video);
        assert!(matches!(
            session.on_remote_track(audio),
            RemoteStreamChange::Added(_)
        ));
        assert!(session.remote_video_muted());
        assert!(matches!(
            session.on_remote_track(video),
            RemoteStreamChange::Same(_)
        ));
        assert!(!session.remote_video_muted());
        assert_eq!(session.remote_stream().unwrap().tracks().len(), 2);

        assert!(session.on_remote_track_ended("v"));
        assert!(session.remote_video_muted());

        let other = RemoteTrack::new("v2", "stream2", TrackKind::Video);
        match session.on_remote_track(other) {
            RemoteStreamChange::Replaced { previous, current } => {
                assert_eq!(previous.stream_id(), "stream1");
                assert_eq!(current.stream_id(), "stream2");
            }
            change => panic!("Expected replaced stream, got {change:?}"),
        }
    }

    #[test(tokio::test)]
    async fn end_of_candidates_and_closed_session_skip_candidates() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;

        assert!(!session.add_remote_candidate(None).await.unwrap());
        session.close().await;
        assert!(!session.add_remote_candidate(Some("candidate")).await.unwrap());
        assert!(engine.connections()[0].applied_candidates().is_empty());
        assert!(engine.connections()[0].is_closed());
    }

    #[test(tokio::test)]
    async fn local_description_sent_wakes_spawned_waiter() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.local_description_sent().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        session.mark_local_description_sent();
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("waiter did not wake")
            .unwrap();

        // Already sent resolves immediately.
        tokio::time::timeout(
            std::time::Duration::from_millis(100),
            session.local_description_sent(),
        )
        .await
        .unwrap();
    }

    #[test(tokio::test)]
    async fn local_description_sent_pending_after_close() {
        let engine = MockEngine::new();
        let session = session(&engine, "peer1").await;

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.local_description_sent().await }
        });
        session.close().await;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), waiter).await;
        assert!(result.is_err());
    }
}

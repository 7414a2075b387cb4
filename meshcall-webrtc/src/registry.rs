use crate::engine::RtcEngine;
use crate::error::WebrtcError;
use crate::session::PeerSession;
use async_trait::async_trait;
use meshcall_media::{LocalTrack, OutboundVideo};
use meshcall_protocol::ice::IceConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

/// The single source of truth for peer sessions: at most one per remote peer ID.
pub struct PeerRegistry {
    engine: Arc<dyn RtcEngine>,
    ice: IceConfig,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    next_generation: AtomicU64,
}

impl PeerRegistry {
    pub fn new(engine: Arc<dyn RtcEngine>, ice: IceConfig) -> Self {
        Self {
            engine,
            ice,
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    async fn create_session(&self, peer_id: &str) -> Result<Arc<PeerSession>, WebrtcError> {
        let connection = self.engine.create_connection(&self.ice).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(PeerSession::new(peer_id, generation, connection)))
    }

    /// Returns the session for the peer, creating it if none exists.
    ///
    /// The boolean is `true` if the session was newly created.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn get_or_create(
        &self,
        peer_id: &str,
    ) -> Result<(Arc<PeerSession>, bool), WebrtcError> {
        if let Some(session) = self.get(peer_id) {
            return Ok((session, false));
        }

        let session = self.create_session(peer_id).await?;
        let existing = {
            let mut sessions = self.sessions.write();
            match sessions.get(peer_id) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    sessions.insert(peer_id.to_string(), Arc::clone(&session));
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                tracing::debug!("Session created concurrently, discarding new one");
                session.close().await;
                Ok((existing, false))
            }
            None => {
                tracing::debug!(generation = session.generation(), "Created peer session");
                Ok((session, true))
            }
        }
    }

    /// Closes any existing session for the peer and registers a fresh one.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn replace(&self, peer_id: &str) -> Result<Arc<PeerSession>, WebrtcError> {
        if let Some(previous) = self.remove(peer_id).await {
            tracing::debug!(
                generation = previous.generation(),
                "Replaced existing peer session"
            );
        }

        let session = self.create_session(peer_id).await?;
        let previous = self
            .sessions
            .write()
            .insert(peer_id.to_string(), Arc::clone(&session));
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(session)
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(peer_id).cloned()
    }

    /// Removes and closes the peer's session. Does nothing if there is none.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        let session = self.sessions.write().remove(peer_id)?;
        session.close().await;
        Some(session)
    }

    /// Removes the given session only if it is still the registered one for its peer.
    ///
    /// The session itself is closed either way.
    pub async fn remove_session(&self, session: &Arc<PeerSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(session.peer_id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.peer_id());
                    true
                }
                _ => false,
            }
        };
        session.close().await;
        removed
    }

    /// Whether the given session is the one currently registered for its peer.
    pub fn is_current(&self, session: &PeerSession) -> bool {
        self.sessions
            .read()
            .get(session.peer_id())
            .is_some_and(|current| current.generation() == session.generation())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut peer_ids = self.sessions.read().keys().cloned().collect::<Vec<_>>();
        peer_ids.sort();
        peer_ids
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write());
        for session in sessions.into_values() {
            session.close().await;
        }
    }
}

#[async_trait]
impl OutboundVideo for PeerRegistry {
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> usize {
        let mut replaced = 0;
        for session in self.sessions() {
            match session.replace_video_track(Arc::clone(&track)).await {
                Ok(true) => replaced += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(peer_id = ?session.peer_id(), ?err, "Failed to replace video track");
                }
            }
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEngine, MockOp};
    use crate::session::SignalingState;
    use meshcall_media::{TrackCodec, TrackKind};
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn registry(engine: &MockEngine) -> PeerRegistry {
        PeerRegistry::new(Arc::new(engine.clone()), IceConfig::default())
    }

    #[test(tokio::test)]
    async fn get_or_create_reuses_session() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        let (first, created) = registry.get_or_create("peer1").await.unwrap();
        assert!(created);
        let (second, created) = registry.get_or_create("peer1").await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(engine.connections().len(), 1);
    }

    #[test(tokio::test)]
    async fn replace_closes_prior_session() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        let (first, _) = registry.get_or_create("peer1").await.unwrap();
        let second = registry.replace("peer1").await.unwrap();

        assert_eq!(first.state(), SignalingState::Closed);
        assert_eq!(second.state(), SignalingState::New);
        assert!(second.generation() > first.generation());
        assert_eq!(registry.len(), 1);
        assert_eq!(engine.open_connections(), 1);
        assert!(!registry.is_current(&first));
        assert!(registry.is_current(&second));
    }

    #[test(tokio::test)]
    async fn remove_absent_is_noop() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        assert!(registry.remove("ghost").await.is_none());
        registry.get_or_create("peer1").await.unwrap();
        assert!(registry.remove("peer1").await.is_some());
        assert!(registry.remove("peer1").await.is_none());
        assert!(registry.is_empty());
        assert_eq!(engine.open_connections(), 0);
    }

    #[test(tokio::test)]
    async fn remove_stale_session_keeps_current() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        let (stale, _) = registry.get_or_create("peer1").await.unwrap();
        let current = registry.replace("peer1").await.unwrap();

        assert!(!registry.remove_session(&stale).await);
        assert!(Arc::ptr_eq(&registry.get("peer1").unwrap(), &current));
        assert!(registry.remove_session(&current).await);
        assert!(registry.is_empty());
    }

    #[test(tokio::test)]
    async fn count_matches_join_leave_sequence() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        for peer in ["a", "b", "c", "a", "d"] {
            registry.get_or_create(peer).await.unwrap();
        }
        registry.remove("b").await;
        registry.remove("x").await;
        registry.get_or_create("b").await.unwrap();
        registry.remove("c").await;

        assert_eq!(registry.peer_ids(), vec!["a", "b", "d"]);
        assert_eq!(engine.open_connections(), registry.len());
    }

    #[test(tokio::test)]
    async fn failed_connection_creation_registers_nothing() {
        let engine = MockEngine::new();
        let registry = registry(&engine);

        engine.fail_next(MockOp::CreateConnection);
        assert!(registry.get_or_create("peer1").await.is_err());
        assert!(registry.is_empty());
    }

    #[test(tokio::test)]
    async fn replace_video_track_in_every_session() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let video = LocalTrack::new(TrackKind::Video, TrackCodec::vp8(), None, None);

        for peer in ["a", "b"] {
            let (session, _) = registry.get_or_create(peer).await.unwrap();
            session
                .attach_local_tracks(std::slice::from_ref(&video))
                .await
                .unwrap();
        }
        registry.get_or_create("c").await.unwrap();

        let replacement = LocalTrack::new(TrackKind::Video, TrackCodec::vp8(), None, None);
        assert_eq!(registry.replace_video_track(Arc::clone(&replacement)).await, 2);
        for session in registry.sessions() {
            assert!(
                session
                    .connection()
                    .sender_tracks()
                    .iter()
                    .all(|(_, id)| id == replacement.id())
            );
        }
    }

    #[test(tokio::test)]
    async fn close_all_empties_registry() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        for peer in ["a", "b", "c"] {
            registry.get_or_create(peer).await.unwrap();
        }

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(engine.open_connections(), 0);
    }
}

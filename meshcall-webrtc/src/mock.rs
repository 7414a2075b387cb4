//! In-memory [`RtcEngine`] producing deterministic session descriptions and candidates.
//!
//! Descriptions have the form `mock-offer:<stream id>:<connection id>` (or `mock-answer:...`).
//! Applying a remote description announces the remote audio and video tracks of the stream it names.

use crate::config::PEER_EVENTS_CAPACITY;
use crate::engine::{ConnectionState, PeerEvent, RemoteTrack, RtcConnection, RtcEngine};
use crate::error::WebrtcError;
use async_trait::async_trait;
use meshcall_media::{LocalTrack, TrackKind};
use meshcall_protocol::ice::IceConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, broadcast};

pub const MOCK_CANDIDATES_PER_DESCRIPTION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateConnection,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

struct MockEngineInner {
    stream_id: String,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    failures: Mutex<HashMap<MockOp, usize>>,
    answer_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockEngineInner {
    fn should_fail(&self, op: MockOp) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&op) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn check(&self, op: MockOp) -> Result<(), WebrtcError> {
        if self.should_fail(op) {
            tracing::debug!(?op, "Injected mock failure");
            return Err(anyhow::anyhow!("injected {op:?} failure").into());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockEngine {
    inner: Arc<MockEngineInner>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            inner: Arc::new(MockEngineInner {
                stream_id: uuid::Uuid::new_v4().to_string(),
                connections: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                answer_gate: Mutex::new(None),
            }),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Makes the next invocation of the given operation fail.
    pub fn fail_next(&self, op: MockOp) {
        *self.inner.failures.lock().entry(op).or_default() += 1;
    }

    /// Makes answer creation wait until the returned gate is notified.
    pub fn hold_answers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.answer_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Every connection created by this engine, in creation order.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.inner.connections.lock().clone()
    }

    pub fn open_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_connection(
        &self,
        _ice: &IceConfig,
    ) -> Result<Arc<dyn RtcConnection>, WebrtcError> {
        self.inner.check(MockOp::CreateConnection)?;

        let mut connections = self.inner.connections.lock();
        let connection = Arc::new(MockConnection {
            engine: Arc::clone(&self.inner),
            id: connections.len(),
            senders: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            events_tx: broadcast::channel(PEER_EVENTS_CAPACITY).0,
            closed: AtomicBool::new(false),
        });
        connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct MockConnection {
    engine: Arc<MockEngineInner>,
    id: usize,
    senders: Mutex<Vec<(TrackKind, String)>>,
    local_description: Mutex<Option<String>>,
    remote_descriptions: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    events_tx: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn local_description(&self) -> Option<String> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_descriptions.lock().last().cloned()
    }

    pub fn remote_description_count(&self) -> usize {
        self.remote_descriptions.lock().len()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Emits a connection event as if the engine had produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn description(&self, kind: &str) -> String {
        format!("mock-{kind}:{}:{}", self.engine.stream_id, self.id)
    }

    fn both_descriptions_set(&self) -> bool {
        self.local_description.lock().is_some() && !self.remote_descriptions.lock().is_empty()
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), WebrtcError> {
        self.senders
            .lock()
            .push((track.kind(), track.id().to_string()));
        Ok(())
    }

    fn sender_tracks(&self) -> Vec<(TrackKind, String)> {
        self.senders.lock().clone()
    }

    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<bool, WebrtcError> {
        let mut senders = self.senders.lock();
        match senders.iter_mut().find(|(kind, _)| *kind == track.kind()) {
            Some(sender) => {
                sender.1 = track.id().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_offer(&self) -> Result<String, WebrtcError> {
        tokio::task::yield_now().await;
        self.engine.check(MockOp::CreateOffer)?;
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<String, WebrtcError> {
        let gate = self.engine.answer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.engine.check(MockOp::CreateAnswer)?;
        Ok(self.description("answer"))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), WebrtcError> {
        tokio::task::yield_now().await;
        self.engine.check(MockOp::SetLocalDescription)?;
        *self.local_description.lock() = Some(sdp.to_string());

        for index in 0..MOCK_CANDIDATES_PER_DESCRIPTION {
            self.emit(PeerEvent::IceCandidate(Some(format!(
                "candidate:{}:{index}",
                self.id
            ))));
        }
        self.emit(PeerEvent::IceCandidate(None));

        if self.both_descriptions_set() {
            self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), WebrtcError> {
        tokio::task::yield_now().await;
        self.engine.check(MockOp::SetRemoteDescription)?;

        let mut parts = sdp.split(':');
        let (Some(prefix), Some(stream_id)) = (parts.next(), parts.next()) else {
            return Err(anyhow::anyhow!("malformed mock description {sdp:?}").into());
        };
        if !prefix.starts_with("mock-") {
            return Err(anyhow::anyhow!("malformed mock description {sdp:?}").into());
        }
        self.remote_descriptions.lock().push(sdp.to_string());

        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.emit(PeerEvent::Track(RemoteTrack::new(
                format!("{stream_id}-{kind}"),
                stream_id,
                kind,
            )));
        }

        if self.both_descriptions_set() {
            self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), WebrtcError> {
        self.engine.check(MockOp::AddIceCandidate)?;
        if self.remote_descriptions.lock().is_empty() {
            return Err(anyhow::anyhow!("remote description not set").into());
        }
        self.candidates.lock().push(candidate.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    async fn close(&self) -> Result<(), WebrtcError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(PeerEvent::ConnectionState(ConnectionState::Closed));
        }
        Ok(())
    }
}

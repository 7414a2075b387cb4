use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use meshcall_protocol::ws::{MessageKind, SignalingMessage};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const SEND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Default state, no connection to the relay, messages cannot be sent or received.
    /// This state is also set when a disconnect is requested or the transport fails.
    Disconnected,
    /// Connected to the relay, but no room has been joined yet.
    Connected,
    /// Connected to the relay and a [`SignalingMessage::JoinRoom`] has been sent.
    Joined,
}

pub type ListenerId = u64;

type BoxFutUnit = Pin<Box<dyn Future<Output = ()> + Send>>;
type ListenerCb = Arc<dyn Fn(SignalingMessage) -> BoxFutUnit + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: MessageKind,
    callback: ListenerCb,
}

/// Bidirectional signaling channel to a relay, scoped to at most one room.
///
/// Received messages are dispatched to the listeners registered for their [`MessageKind`], in
/// registration order, one message at a time. Messages from one sender are therefore handled in the
/// order the relay delivered them.
pub struct SignalingChannel<ST: SignalingTransport> {
    inner: Arc<SignalingChannelInner<ST>>,
}

impl<ST: SignalingTransport> Clone for SignalingChannel<ST> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<ST: SignalingTransport> SignalingChannel<ST> {
    pub fn new(transport: ST, shutdown_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SignalingChannelInner::new(transport, shutdown_token)),
        }
    }

    /// Subscribes to a watch containing the current [`State`] of the channel.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> State {
        *self.inner.state_tx.borrow()
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.room_id.lock().clone()
    }

    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.inner.connect().await
    }

    /// Joins the given room. The relay announces the local participant to all other members.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn join(&self, room_id: &str) -> Result<(), SignalingError> {
        self.inner
            .send(SignalingMessage::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await?;
        *self.inner.room_id.lock() = Some(room_id.to_string());
        self.inner.set_state(State::Joined);
        Ok(())
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.send(msg).await
    }

    /// Registers a listener for all received messages of the given kind.
    ///
    /// Multiple listeners per kind are allowed and are invoked in registration order.
    pub fn on_message<F, Fut>(&self, kind: MessageKind, handler: F) -> ListenerId
    where
        F: Fn(SignalingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push(Listener {
            id,
            kind,
            callback: Arc::new(move |msg| Box::pin(handler(msg))),
        });
        tracing::trace!(?id, %kind, "Registered signaling listener");
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let len = listeners.len();
        listeners.retain(|listener| listener.id != id);
        len != listeners.len()
    }

    pub fn listener_count(&self, kind: MessageKind) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|listener| listener.kind == kind)
            .count()
    }

    /// Releases the transport. Leaving the room is signaled to the relay before closing.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}

struct SignalingChannelInner<ST: SignalingTransport> {
    transport: ST,

    state_tx: watch::Sender<State>,
    room_id: Mutex<Option<String>>,

    listeners: Arc<Mutex<Vec<Listener>>>,
    next_listener_id: AtomicU64,

    disconnect_token: Mutex<CancellationToken>,
    shutdown_token: CancellationToken,

    send_tx: Mutex<Option<mpsc::Sender<SignalingMessage>>>,
    worker_tasks: Mutex<JoinSet<()>>,
}

impl<ST: SignalingTransport> SignalingChannelInner<ST> {
    fn new(transport: ST, shutdown_token: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(State::Disconnected);
        Self {
            transport,
            state_tx,
            room_id: Mutex::new(None),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
            disconnect_token: Mutex::new(shutdown_token.child_token()),
            shutdown_token,
            send_tx: Mutex::new(None),
            worker_tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: State) {
        self.state_tx.send_replace(state);
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.state() != State::Disconnected {
            tracing::warn!("Signaling channel is already connected");
            return Err(SignalingError::AlreadyConnected);
        }

        tracing::trace!("Connecting to signaling relay");
        let (sender, receiver) = self.transport.connect().await?;

        let (send_tx, send_rx) = mpsc::channel::<SignalingMessage>(SEND_CHANNEL_SIZE);
        let disconnect_token = self.disconnect_token.lock().clone();
        {
            let mut tasks = self.worker_tasks.lock();
            tasks.spawn(Self::reader_task(
                receiver,
                Arc::clone(&self.listeners),
                self.state_tx.clone(),
                disconnect_token.clone(),
            ));
            tasks.spawn(Self::writer_task(
                sender,
                send_rx,
                self.state_tx.clone(),
                disconnect_token,
            ));
        }

        *self.send_tx.lock() = Some(send_tx);
        self.set_state(State::Connected);

        tracing::debug!("Successfully connected to signaling relay");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, msg), fields(kind = %msg.kind()), err)]
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if self.state() == State::Disconnected {
            tracing::warn!("Tried to send message while disconnected");
            return Err(SignalingError::Disconnected);
        }

        let send_tx = self
            .send_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(SignalingError::Disconnected)?;

        tracing::trace!("Sending message to send channel");
        send_tx
            .send(msg)
            .await
            .map_err(|err| SignalingError::SendFailure(err.to_string()))
    }

    #[instrument(level = "debug", skip(self))]
    async fn disconnect(&self) {
        if self.state() == State::Joined {
            tracing::trace!("Sending leave message before disconnecting");
            if let Err(err) = self.send(SignalingMessage::LeaveRoom).await {
                tracing::warn!(?err, "Failed to send LeaveRoom message before disconnecting");
            }
        }

        // Drop the send channel so the writer drains queued messages before closing.
        self.send_tx.lock().take();

        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        tracing::trace!("Waiting for writer task to flush and close the transport");
        if let Some(Err(err)) = worker_tasks.join_next().await
            && !err.is_cancelled()
        {
            tracing::warn!(?err, "Failed to join worker task");
        }

        self.disconnect_token.lock().cancel();
        worker_tasks.abort_all();
        while let Some(res) = worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }

        *self.disconnect_token.lock() = self.shutdown_token.child_token();
        self.room_id.lock().take();
        self.set_state(State::Disconnected);
        tracing::debug!("Disconnected from signaling relay");
    }

    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        listeners: Arc<Mutex<Vec<Listener>>>,
        state_tx: watch::Sender<State>,
        disconnect_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport reader task");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, exiting transport reader task");
                        break;
                    }

                    msg = receiver.recv() => {
                        match msg {
                            Ok(message) => {
                                let kind = message.kind();
                                let callbacks = listeners
                                    .lock()
                                    .iter()
                                    .filter(|listener| listener.kind == kind)
                                    .map(|listener| Arc::clone(&listener.callback))
                                    .collect::<Vec<_>>();

                                if callbacks.is_empty() {
                                    tracing::trace!(%kind, "No listeners registered, dropping message");
                                    continue;
                                }

                                for callback in callbacks {
                                    callback(message.clone()).await;
                                }
                            }
                            Err(SignalingError::SerializationError(err)) => {
                                tracing::warn!(?err, "Skipping malformed message");
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Transport failed, exiting transport reader task");
                                state_tx.send_replace(State::Disconnected);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }

    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<SignalingMessage>,
        state_tx: watch::Sender<State>,
        disconnect_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport writer task");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, exiting transport writer task");
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(err) = sender.send(msg).await {
                                    tracing::warn!(?err, "Failed to send message to transport");
                                    state_tx.send_replace(State::Disconnected);
                                    break;
                                }
                            }
                            None => {
                                tracing::debug!("Send channel closed, exiting transport writer task");
                                break;
                            }
                        }
                    }
                }
            }

            if let Err(err) = sender.close().await {
                tracing::warn!(?err, "Failed to close transport");
            }
        }
        .instrument(tracing::Span::current())
    }
}

impl<ST: SignalingTransport> Drop for SignalingChannelInner<ST> {
    fn drop(&mut self) {
        self.disconnect_token.lock().cancel();
        self.worker_tasks.lock().abort_all();
    }
}

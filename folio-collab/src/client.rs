//! Sync client: one connection, many open documents.
//!
//! [`SyncClient`] is a cheap `Clone` handle. Every operation is a command
//! sent to a single actor task that owns the connection and every
//! [`DocumentSession`], so no document is ever mutated from two places.
//!
//! ```text
//!   SyncClient (Clone)      mpsc        ClientActor (tokio task)
//!   ┌──────────────────┐  ────────▶  ┌────────────────────────────────┐
//!   │ .open_document() │             │ sessions: object_id → session  │
//!   │ .apply_local_..()│  ◀────────  │ connection + reconnect backoff │
//!   │ .cursor()        │   oneshot   │ tick: handshake retry, heartbeat│
//!   └──────────────────┘             └───────────────┬────────────────┘
//!                                                    │ SyncEvent (bounded)
//!                                                    ▼
//!                                               host application
//! ```
//!
//! Connection states: `Disconnected → Connecting → Connected → Disconnected`.
//! Every entry into `Connected` re-runs the handshake for every open
//! document. Reconnect attempts never stop; their spacing follows the
//! configured [`Backoff`].
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::crdt::CrdtEngine;
use crate::handshake::HandshakeConfig;
use crate::protocol::{CollabType, Message};
use crate::rid::Rid;
use crate::session::{DocumentSession, Effects, SessionConfig, SessionError, SyncEvent};
use crate::storage::CursorStore;
use crate::transport::{Transport, TransportError};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Spacing of reconnect attempts.
    pub reconnect: Backoff,
    pub handshake: HandshakeConfig,
    pub awareness_heartbeat: Duration,
    /// How often handshake deadlines and heartbeats are checked.
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    /// Consecutive undecodable frames tolerated before reconnecting.
    pub max_malformed_frames: u32,
    pub event_capacity: usize,
    /// Per-document bound on held local edits.
    pub held_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            reconnect: Backoff::default(),
            handshake: session.handshake,
            awareness_heartbeat: session.awareness_heartbeat,
            tick_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            max_malformed_frames: 8,
            event_capacity: 256,
            held_capacity: session.held_capacity,
        }
    }
}

impl ClientConfig {
    pub fn with_reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = backoff;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_awareness_heartbeat(mut self, interval: Duration) -> Self {
        self.awareness_heartbeat = interval;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_malformed_frames(mut self, max: u32) -> Self {
        self.max_malformed_frames = max.max(1);
        self
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake: self.handshake.clone(),
            awareness_heartbeat: self.awareness_heartbeat,
            held_capacity: self.held_capacity,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("sync client shut down")]
    Shutdown,
    #[error("document {0} is already open")]
    AlreadyOpen(String),
    #[error("document {0} is not open")]
    NotOpen(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

enum Command {
    Open {
        object_id: String,
        collab_type: CollabType,
        engine: Box<dyn CrdtEngine>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        object_id: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    LocalChange {
        object_id: String,
        delta: Vec<u8>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    LocalAwareness {
        object_id: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Cursor {
        object_id: String,
        reply: oneshot::Sender<Result<Rid, ClientError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct SyncClient {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SyncClient {
    /// Spawn the client actor. Must be called inside a tokio runtime.
    ///
    /// The first connect attempt starts immediately.
    pub fn start(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        cursors: Arc<dyn CursorStore>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ClientActor {
            session_config: config.session_config(),
            config,
            transport,
            cursors,
            sessions: HashMap::new(),
            outgoing: None,
            incoming: None,
            state: state_tx,
            events: event_tx,
            attempt: 0,
            reconnect_at: Some(Instant::now()),
            malformed_streak: 0,
        };
        tokio::spawn(actor.run(rx));

        (Self { tx, state: state_rx }, event_rx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Start syncing a document. Sends a `SyncRequest` at once if connected.
    pub async fn open_document(
        &self,
        object_id: impl Into<String>,
        collab_type: CollabType,
        engine: impl CrdtEngine + 'static,
    ) -> Result<(), ClientError> {
        let object_id = object_id.into();
        let engine: Box<dyn CrdtEngine> = Box::new(engine);
        self.request(|reply| Command::Open {
            object_id,
            collab_type,
            engine,
            reply,
        })
        .await
    }

    /// Stop syncing a document. Its persisted cursor is kept.
    pub async fn close_document(&self, object_id: &str) -> Result<(), ClientError> {
        self.request(|reply| Command::Close {
            object_id: object_id.to_owned(),
            reply,
        })
        .await
    }

    /// Send a delta produced by a local edit. Held while offline or read-only.
    pub async fn apply_local_change(&self, object_id: &str, delta: Vec<u8>) -> Result<(), ClientError> {
        self.request(|reply| Command::LocalChange {
            object_id: object_id.to_owned(),
            delta,
            reply,
        })
        .await
    }

    pub async fn set_local_awareness(&self, object_id: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.request(|reply| Command::LocalAwareness {
            object_id: object_id.to_owned(),
            payload,
            reply,
        })
        .await
    }

    /// Last applied stream position of an open document.
    pub async fn cursor(&self, object_id: &str) -> Result<Rid, ClientError> {
        self.request(|reply| Command::Cursor {
            object_id: object_id.to_owned(),
            reply,
        })
        .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the connection and stop the actor.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

enum Wake {
    Command(Option<Command>),
    Frame(Option<Vec<u8>>),
    Reconnect,
    Tick,
}

struct ClientActor {
    config: ClientConfig,
    session_config: SessionConfig,
    transport: Arc<dyn Transport>,
    cursors: Arc<dyn CursorStore>,
    sessions: HashMap<String, DocumentSession>,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    incoming: Option<mpsc::Receiver<Vec<u8>>>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SyncEvent>,
    attempt: u32,
    reconnect_at: Option<Instant>,
    malformed_streak: u32,
}

async fn next_frame(incoming: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn session_now() -> std::time::Instant {
    Instant::now().into_std()
}

impl ClientActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                frame = next_frame(&mut self.incoming) => Wake::Frame(frame),
                _ = sleep_until(self.reconnect_at) => Wake::Reconnect,
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(Command::Shutdown { reply })) => {
                    self.disconnect();
                    let _ = reply.send(());
                    break;
                }
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Frame(Some(frame)) => self.on_frame(&frame).await,
                Wake::Frame(None) => self.connection_lost("closed by peer"),
                Wake::Reconnect => self.connect().await,
                Wake::Tick => self.on_tick().await,
            }
        }
        log::info!("Sync client stopped");
    }

    fn is_connected(&self) -> bool {
        self.outgoing.is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event channel full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ─── Connection ───────────────────────────────────────────────────

    async fn connect(&mut self) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);

        let result = match tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(conn) => {
                self.attempt = 0;
                self.malformed_streak = 0;
                self.outgoing = Some(conn.outgoing);
                self.incoming = Some(conn.incoming);
                self.set_state(ConnectionState::Connected);
                log::info!("Connected, resyncing {} documents", self.sessions.len());
                self.emit(SyncEvent::Connected);

                let now = session_now();
                let mut fx = Effects::default();
                for session in self.sessions.values_mut() {
                    session.on_connected(now, &mut fx);
                }
                self.flush(fx).await;
            }
            Err(e) => self.schedule_reconnect(&e),
        }
    }

    fn schedule_reconnect(&mut self, cause: &TransportError) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.config.reconnect.delay(self.attempt);
        log::warn!("Connect attempt {} failed ({cause}), retrying in {delay:?}", self.attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop the connection and schedule a reconnect.
    fn connection_lost(&mut self, reason: &str) {
        if !self.is_connected() {
            return;
        }
        log::warn!("Connection lost: {reason}");
        self.disconnect();
        self.emit(SyncEvent::Disconnected);
        self.schedule_reconnect(&TransportError::Closed);
    }

    fn disconnect(&mut self) {
        self.outgoing = None;
        self.incoming = None;
        for session in self.sessions.values_mut() {
            session.on_disconnected();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Surface events, then send frames. A failed send drops the
    /// connection; sessions re-queue what was not acknowledged.
    async fn flush(&mut self, fx: Effects) {
        for event in fx.events {
            self.emit(event);
        }
        for message in fx.outgoing {
            let Some(outgoing) = &self.outgoing else {
                break;
            };
            if outgoing.send(message.encode()).await.is_err() {
                self.connection_lost("send failed");
                break;
            }
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_streak += 1;
                log::warn!(
                    "Dropping malformed frame ({} bytes, {} in a row): {e}",
                    frame.len(),
                    self.malformed_streak
                );
                if self.malformed_streak >= self.config.max_malformed_frames {
                    self.connection_lost("too many malformed frames");
                }
                return;
            }
        };
        self.malformed_streak = 0;

        match message {
            Message::Notification(notification) => {
                self.emit(SyncEvent::Notification(notification));
            }
            Message::Collab(msg) => {
                let Some(session) = self.sessions.get_mut(&msg.object_id) else {
                    log::debug!("Frame for unopened document {}", msg.object_id);
                    return;
                };
                let mut fx = Effects::default();
                session.handle(msg.data, session_now(), &mut fx);
                self.flush(fx).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = session_now();
        let mut fx = Effects::default();
        for session in self.sessions.values_mut() {
            session.tick(now, &mut fx);
        }
        if !fx.is_empty() {
            self.flush(fx).await;
        }
    }

    // ─── Commands ─────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open {
                object_id,
                collab_type,
                engine,
                reply,
            } => {
                if self.sessions.contains_key(&object_id) {
                    let _ = reply.send(Err(ClientError::AlreadyOpen(object_id)));
                    return;
                }
                let mut session = DocumentSession::new(
                    object_id.clone(),
                    collab_type,
                    engine,
                    self.cursors.clone(),
                    &self.session_config,
                );
                let mut fx = Effects::default();
                if self.is_connected() {
                    session.on_connected(session_now(), &mut fx);
                }
                log::info!("Opened {object_id} at {}", session.cursor());
                self.sessions.insert(object_id, session);
                let _ = reply.send(Ok(()));
                self.flush(fx).await;
            }
            Command::Close { object_id, reply } => {
                let result = match self.sessions.remove(&object_id) {
                    Some(mut session) => {
                        session.close();
                        log::info!("Closed {object_id}");
                        Ok(())
                    }
                    None => Err(ClientError::NotOpen(object_id)),
                };
                let _ = reply.send(result);
            }
            Command::LocalChange {
                object_id,
                delta,
                reply,
            } => {
                let Some(session) = self.sessions.get_mut(&object_id) else {
                    let _ = reply.send(Err(ClientError::NotOpen(object_id)));
                    return;
                };
                let mut fx = Effects::default();
                let result = session.emit_local_change(delta, &mut fx);
                let _ = reply.send(result.map_err(ClientError::from));
                self.flush(fx).await;
            }
            Command::LocalAwareness {
                object_id,
                payload,
                reply,
            } => {
                let Some(session) = self.sessions.get_mut(&object_id) else {
                    let _ = reply.send(Err(ClientError::NotOpen(object_id)));
                    return;
                };
                let mut fx = Effects::default();
                let result = session.set_local_awareness(payload, session_now(), &mut fx);
                let _ = reply.send(result.map_err(ClientError::from));
                self.flush(fx).await;
            }
            Command::Cursor { object_id, reply } => {
                let result = match self.sessions.get(&object_id) {
                    Some(session) => Ok(session.cursor()),
                    None => Err(ClientError::NotOpen(object_id)),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
        }
    }
}

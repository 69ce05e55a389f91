//! One open document: handshake, dispatcher, awareness and access state
//! composed behind a single frame handler.
//!
//! ```text
//!  inbound CollabData ──► DocumentSession::handle ──┬─► SyncRequest  → reply with update_since
//!                                                   ├─► Update       → UpdateDispatcher (+ handshake)
//!                                                   ├─► Awareness    → AwarenessChannel
//!                                                   └─► AccessChanged→ AccessControl transition
//!                                   │
//!                                   ▼
//!                         Effects { outgoing frames, events }
//! ```
//!
//! Sessions never touch the network. Every call appends frames to send and
//! events to surface into an [`Effects`] the caller drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::access::{AccessControl, AccessTransition, Capabilities};
use crate::awareness::{AwarenessChannel, DEFAULT_HEARTBEAT};
use crate::crdt::CrdtEngine;
use crate::dispatcher::{DispatchError, UpdateDispatcher, UpdateOutcome, DEFAULT_HELD_CAPACITY};
use crate::handshake::{reply_to, HandshakeConfig, HandshakeState, RetryVerdict, SyncHandshake};
use crate::protocol::{
    AccessChanged, AccessReason, CollabData, CollabType, Message, SyncRequest, Update,
    WorkspaceNotification,
};
use crate::rid::Rid;
use crate::storage::CursorStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("access to {0} was revoked")]
    AccessDenied(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Everything surfaced to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A remote update was applied to the replica.
    ContentChanged { object_id: String, message_id: Rid },
    /// A handshake round completed.
    Synced { object_id: String },
    /// Still syncing after several unanswered requests.
    SyncStalled { object_id: String, attempts: u32 },
    /// Unable to sync; local editing continues and requests keep going out.
    SyncFailed { object_id: String, attempts: u32 },
    AwarenessChanged { object_id: String },
    ReadOnly { object_id: String, reason: AccessReason },
    WriteRestored { object_id: String },
    /// Read access revoked; the document stops syncing.
    DocumentClosed { object_id: String, reason: AccessReason },
    AccessRestored { object_id: String, can_write: bool },
    Notification(WorkspaceNotification),
}

/// Per-document tuning shared by every session of a client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake: HandshakeConfig,
    pub awareness_heartbeat: Duration,
    pub held_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            awareness_heartbeat: DEFAULT_HEARTBEAT,
            held_capacity: DEFAULT_HELD_CAPACITY,
        }
    }
}

/// Output of one session call.
#[derive(Debug, Default)]
pub struct Effects {
    pub outgoing: Vec<Message>,
    pub events: Vec<SyncEvent>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty()
    }
}

pub struct DocumentSession {
    object_id: String,
    collab_type: CollabType,
    engine: Box<dyn CrdtEngine>,
    handshake: SyncHandshake,
    dispatcher: UpdateDispatcher,
    awareness: AwarenessChannel,
    access: AccessControl,
    connected: bool,
}

impl DocumentSession {
    pub fn new(
        object_id: impl Into<String>,
        collab_type: CollabType,
        engine: Box<dyn CrdtEngine>,
        cursors: Arc<dyn CursorStore>,
        config: &SessionConfig,
    ) -> Self {
        let object_id = object_id.into();
        let dispatcher = UpdateDispatcher::new(object_id.clone(), cursors, config.held_capacity);
        Self {
            object_id,
            collab_type,
            engine,
            handshake: SyncHandshake::new(config.handshake.clone()),
            dispatcher,
            awareness: AwarenessChannel::new(config.awareness_heartbeat),
            access: AccessControl::default(),
            connected: false,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn collab_type(&self) -> CollabType {
        self.collab_type
    }

    pub fn cursor(&self) -> Rid {
        self.dispatcher.cursor()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.access.capabilities()
    }

    pub fn held_len(&self) -> usize {
        self.dispatcher.held_len()
    }

    fn push(&self, fx: &mut Effects, data: CollabData) {
        fx.outgoing
            .push(Message::collab(self.object_id.clone(), self.collab_type, data));
    }

    fn send_update(&self, fx: &mut Effects, update: Update) {
        self.push(fx, CollabData::Update(update));
    }

    fn current_request(&self) -> SyncRequest {
        SyncRequest {
            last_message_id: self.dispatcher.cursor(),
            state_vector: self.engine.state_vector(),
        }
    }

    fn begin_handshake(&mut self, now: Instant, fx: &mut Effects) {
        let request = self
            .handshake
            .begin(now, self.dispatcher.cursor(), self.engine.state_vector());
        log::debug!("Sync request for {} from {}", self.object_id, request.last_message_id);
        self.push(fx, CollabData::SyncRequest(request));
    }

    fn flush_held(&mut self, fx: &mut Effects) {
        for update in self.dispatcher.flush_held() {
            self.send_update(fx, update);
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// The transport (re)connected.
    ///
    /// Sends exactly one `SyncRequest`. A revoked document sends it only to
    /// stay subscribed for access changes; no reply is awaited.
    pub fn on_connected(&mut self, now: Instant, fx: &mut Effects) {
        self.connected = true;
        self.dispatcher.set_online(true);

        if self.access.is_revoked() {
            let probe = self.current_request();
            self.push(fx, CollabData::SyncRequest(probe));
            return;
        }

        self.begin_handshake(now, fx);
        self.flush_held(fx);
        if let Some(update) = self.awareness.reannounce(now) {
            self.push(fx, CollabData::AwarenessUpdate(update));
        }
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.handshake.cancel();
        self.dispatcher.set_online(false);
    }

    /// Local close. Inbound frames are discarded from now on.
    pub fn close(&mut self) {
        self.handshake.close();
        self.dispatcher.close();
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    pub fn handle(&mut self, data: CollabData, now: Instant, fx: &mut Effects) {
        if self.access.is_revoked() && !matches!(data, CollabData::AccessChanged(_)) {
            log::debug!("Dropping {} for revoked document {}", data.kind(), self.object_id);
            return;
        }

        match data {
            CollabData::SyncRequest(request) => self.on_peer_sync_request(&request, fx),
            CollabData::Update(update) => self.on_update(&update, fx),
            CollabData::AwarenessUpdate(update) => {
                log::trace!("Awareness for {}", self.object_id);
                match self.awareness.on_remote(&mut *self.engine, &update) {
                    Ok(()) => fx.events.push(SyncEvent::AwarenessChanged {
                        object_id: self.object_id.clone(),
                    }),
                    Err(e) => log::warn!("Awareness for {} rejected: {e}", self.object_id),
                }
            }
            CollabData::AccessChanged(change) => self.on_access_changed(&change, now, fx),
        }
    }

    /// The server asks for what it is missing.
    fn on_peer_sync_request(&mut self, request: &SyncRequest, fx: &mut Effects) {
        if !self.connected || !self.access.can_write() {
            log::debug!("Not answering sync request for {}", self.object_id);
            return;
        }
        match reply_to(request, &*self.engine, Rid::ZERO) {
            Ok(reply) => {
                let update = self.dispatcher.emit_sync_reply(reply.payload);
                self.send_update(fx, update);
            }
            Err(e) => log::warn!("Cannot answer sync request for {}: {e}", self.object_id),
        }
    }

    fn on_update(&mut self, update: &Update, fx: &mut Effects) {
        let outcome = match self.dispatcher.on_update(&mut *self.engine, update) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!(
                    "Update {} for {} not applied: {e}",
                    update.message_id,
                    self.object_id
                );
                return;
            }
        };

        match outcome {
            UpdateOutcome::Applied => fx.events.push(SyncEvent::ContentChanged {
                object_id: self.object_id.clone(),
                message_id: update.message_id,
            }),
            UpdateOutcome::Discarded => return,
            UpdateOutcome::Acknowledged | UpdateOutcome::Duplicate => {}
        }

        if update.is_sync_reply() && self.handshake.on_reply() {
            log::info!("{} synced at {}", self.object_id, self.dispatcher.cursor());
            fx.events.push(SyncEvent::Synced {
                object_id: self.object_id.clone(),
            });
        }
    }

    fn on_access_changed(&mut self, change: &AccessChanged, now: Instant, fx: &mut Effects) {
        let transition = self.access.on_access_changed(change);
        log::info!("Access for {} changed: {transition:?}", self.object_id);
        let object_id = self.object_id.clone();

        match transition {
            AccessTransition::Unchanged => {}
            AccessTransition::ReadOnly => {
                self.dispatcher.set_can_write(false);
                fx.events.push(SyncEvent::ReadOnly {
                    object_id,
                    reason: change.reason,
                });
            }
            AccessTransition::WriteRestored => {
                self.dispatcher.set_can_write(true);
                self.flush_held(fx);
                fx.events.push(SyncEvent::WriteRestored { object_id });
            }
            AccessTransition::Revoked => {
                self.handshake.close();
                self.dispatcher.close();
                fx.events.push(SyncEvent::DocumentClosed {
                    object_id,
                    reason: change.reason,
                });
            }
            AccessTransition::Restored { can_write } => {
                self.handshake.reopen();
                self.dispatcher.reopen();
                self.dispatcher.set_can_write(can_write);
                if self.connected {
                    self.begin_handshake(now, fx);
                    self.flush_held(fx);
                }
                fx.events.push(SyncEvent::AccessRestored {
                    object_id,
                    can_write,
                });
            }
        }
    }

    // ─── Local origination ────────────────────────────────────────────

    /// Send (or hold) a locally authored delta.
    pub fn emit_local_change(&mut self, delta: Vec<u8>, fx: &mut Effects) -> Result<(), SessionError> {
        if self.access.is_revoked() {
            return Err(SessionError::AccessDenied(self.object_id.clone()));
        }
        if let Some(update) = self.dispatcher.emit_local_change(delta)? {
            self.send_update(fx, update);
        }
        Ok(())
    }

    pub fn set_local_awareness(
        &mut self,
        payload: Vec<u8>,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<(), SessionError> {
        if self.access.is_revoked() {
            return Err(SessionError::AccessDenied(self.object_id.clone()));
        }
        let update = self.awareness.set_local(payload, now);
        if self.connected {
            self.push(fx, CollabData::AwarenessUpdate(update));
        }
        Ok(())
    }

    // ─── Timers ───────────────────────────────────────────────────────

    pub fn tick(&mut self, now: Instant, fx: &mut Effects) {
        if self.access.is_revoked() {
            return;
        }

        let idle = self.engine.remove_idle_presence(now);
        if !idle.is_empty() {
            log::debug!("Dropped {} idle peers from {}", idle.len(), self.object_id);
            fx.events.push(SyncEvent::AwarenessChanged {
                object_id: self.object_id.clone(),
            });
        }

        if !self.connected {
            return;
        }

        if let Some(retry) = self.handshake.poll_timeout(now) {
            let request = self.current_request();
            self.push(fx, CollabData::SyncRequest(request));
            let object_id = self.object_id.clone();
            match retry.verdict {
                RetryVerdict::Retry => {}
                RetryVerdict::Stalled => fx.events.push(SyncEvent::SyncStalled {
                    object_id,
                    attempts: retry.retries,
                }),
                RetryVerdict::Failed => {
                    log::warn!("Unable to sync {object_id} after {} retries", retry.retries);
                    fx.events.push(SyncEvent::SyncFailed {
                        object_id,
                        attempts: retry.retries,
                    });
                }
            }
        }

        if let Some(update) = self.awareness.heartbeat_due(now) {
            self.push(fx, CollabData::AwarenessUpdate(update));
        }
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("object_id", &self.object_id)
            .field("collab_type", &self.collab_type)
            .field("cursor", &self.dispatcher.cursor())
            .field("handshake", &self.handshake.state())
            .field("access", &self.access.capabilities())
            .field("connected", &self.connected)
            .finish()
    }
}

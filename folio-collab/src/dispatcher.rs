//! Update dispatch for one document.
//!
//! Inbound updates pass through a cursor gate: anything at or below the
//! last applied `Rid` is a duplicate and is dropped without touching the
//! replica. Outbound local deltas are remembered by BLAKE3 digest until
//! the server echoes them back with their final `Rid`; the echo advances
//! the cursor but is never applied a second time.
//!
//! ```text
//! inbound Update ─► closed? ─► rid <= cursor? ─► own echo? ─► apply ─► cursor = rid ─► persist
//!                    │             │                │
//!                 Discarded     Duplicate      Acknowledged
//!
//! local delta ─► online && writable? ─yes─► pending (digest) ─► send
//!                      │
//!                      no ──► held queue ─► flush_held() once sendable
//! ```
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::crdt::{CrdtEngine, CrdtError};
use crate::protocol::{Update, UpdateFlags};
use crate::rid::Rid;
use crate::storage::CursorStore;

/// Default bound on locally held edits.
pub const DEFAULT_HELD_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("document subscription is closed")]
    Closed,
    #[error("held edit queue is full ({capacity} edits)")]
    QueueFull { capacity: usize },
    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

/// Result of feeding one inbound update to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Subscription closed; nothing done.
    Discarded,
    /// `Rid` at or below the cursor; nothing done.
    Duplicate,
    /// Cursor advanced without touching the replica (own echo or empty payload).
    Acknowledged,
    /// Payload applied and cursor advanced.
    Applied,
}

// ───────────────────────────────────────────────────────────────────
// Held edits
// ───────────────────────────────────────────────────────────────────

/// Local deltas that could not be sent yet.
///
/// Replayed in order once the document is connected and writable.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Put previously sent deltas back at the front, keeping their order.
    ///
    /// Ignores the capacity bound: these edits already left the editor and
    /// must not be lost.
    pub fn requeue_front(&mut self, payloads: Vec<Vec<u8>>) {
        for payload in payloads.into_iter().rev() {
            self.queue.push_front(payload);
        }
    }

    /// Drain all queued deltas for replay.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Dispatcher
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmissionKind {
    Edit,
    SyncReply,
}

#[derive(Debug)]
struct PendingEmission {
    digest: blake3::Hash,
    payload: Vec<u8>,
    kind: EmissionKind,
}

pub struct UpdateDispatcher {
    object_id: String,
    cursor: Rid,
    store: Arc<dyn CursorStore>,
    pending: VecDeque<PendingEmission>,
    held: OfflineQueue,
    online: bool,
    can_write: bool,
    closed: bool,
}

impl UpdateDispatcher {
    /// Create a dispatcher, resuming from the persisted cursor if any.
    pub fn new(object_id: impl Into<String>, store: Arc<dyn CursorStore>, held_capacity: usize) -> Self {
        let object_id = object_id.into();
        let cursor = match store.load(&object_id) {
            Ok(Some(rid)) => rid,
            Ok(None) => Rid::ZERO,
            Err(e) => {
                log::warn!("Failed to load cursor for {object_id}, starting from zero: {e}");
                Rid::ZERO
            }
        };
        Self {
            object_id,
            cursor,
            store,
            pending: VecDeque::new(),
            held: OfflineQueue::new(held_capacity),
            online: false,
            can_write: true,
            closed: false,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn cursor(&self) -> Rid {
        self.cursor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    fn sendable(&self) -> bool {
        self.online && self.can_write && !self.closed
    }

    /// Feed one inbound update.
    pub fn on_update<E: CrdtEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        update: &Update,
    ) -> Result<UpdateOutcome, DispatchError> {
        if self.closed {
            return Ok(UpdateOutcome::Discarded);
        }
        if update.message_id <= self.cursor {
            log::debug!(
                "Duplicate update {} for {} (cursor {})",
                update.message_id,
                self.object_id,
                self.cursor
            );
            return Ok(UpdateOutcome::Duplicate);
        }

        let outcome = if update.payload.is_empty() || self.take_echo(&update.payload) {
            UpdateOutcome::Acknowledged
        } else {
            engine.apply_update(&update.payload)?;
            UpdateOutcome::Applied
        };
        self.advance(update.message_id);
        Ok(outcome)
    }

    fn take_echo(&mut self, payload: &[u8]) -> bool {
        let digest = blake3::hash(payload);
        let found = self
            .pending
            .iter()
            .position(|p| p.digest == digest && p.payload == payload);
        match found {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    fn advance(&mut self, rid: Rid) {
        self.cursor = rid;
        if let Err(e) = self.store.save(&self.object_id, rid) {
            log::warn!("Failed to persist cursor {rid} for {}: {e}", self.object_id);
        }
    }

    fn remember(&mut self, payload: &[u8], kind: EmissionKind) {
        self.pending.push_back(PendingEmission {
            digest: blake3::hash(payload),
            payload: payload.to_vec(),
            kind,
        });
    }

    /// Wrap a locally authored delta for sending.
    ///
    /// Returns `None` if the delta was held because the document is
    /// offline or read-only.
    pub fn emit_local_change(&mut self, delta: Vec<u8>) -> Result<Option<Update>, DispatchError> {
        if self.closed {
            return Err(DispatchError::Closed);
        }
        if !self.sendable() {
            if !self.held.enqueue(delta) {
                return Err(DispatchError::QueueFull {
                    capacity: self.held.capacity(),
                });
            }
            return Ok(None);
        }
        self.remember(&delta, EmissionKind::Edit);
        Ok(Some(Update::local(delta)))
    }

    /// Wrap our answer to the server's `SyncRequest`.
    ///
    /// The server relays it back like any other update, so it is tracked
    /// for echo suppression too.
    pub fn emit_sync_reply(&mut self, payload: Vec<u8>) -> Update {
        // An empty reply is never relayed, so there is no echo to wait for.
        if !payload.is_empty() {
            self.remember(&payload, EmissionKind::SyncReply);
        }
        Update {
            message_id: Rid::ZERO,
            flags: UpdateFlags::SYNC_REPLY,
            payload,
        }
    }

    /// Replay held edits if the document is sendable.
    pub fn flush_held(&mut self) -> Vec<Update> {
        if !self.sendable() || self.held.is_empty() {
            return Vec::new();
        }
        let held = self.held.drain();
        log::info!("Replaying {} held edits for {}", held.len(), self.object_id);
        held.into_iter()
            .map(|delta| {
                self.remember(&delta, EmissionKind::Edit);
                Update::local(delta)
            })
            .collect()
    }

    /// Edits sent but not yet echoed go back to the held queue. Sync
    /// replies are dropped; the next handshake recomputes them.
    fn hold_pending(&mut self) {
        let edits: Vec<Vec<u8>> = self
            .pending
            .drain(..)
            .filter(|p| p.kind == EmissionKind::Edit)
            .map(|p| p.payload)
            .collect();
        if !edits.is_empty() {
            log::debug!("Holding {} unacknowledged edits for {}", edits.len(), self.object_id);
            self.held.requeue_front(edits);
        }
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
        if !online {
            self.hold_pending();
        }
    }

    pub fn set_can_write(&mut self, can_write: bool) {
        self.can_write = can_write;
        if !can_write {
            self.hold_pending();
        }
    }

    /// Stop applying updates. Held edits are kept.
    pub fn close(&mut self) {
        self.hold_pending();
        self.closed = true;
    }

    pub fn reopen(&mut self) {
        self.closed = false;
    }
}

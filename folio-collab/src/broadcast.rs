//! Per-document fan-out to connection outboxes with backpressure.
//!
//! Every connection owns one bounded outbox. A document room holds a
//! [`PeerHandle`] for each subscribed connection and pushes pre-encoded
//! frames into those outboxes without awaiting. A full outbox means the
//! peer cannot keep up: the frame is dropped and the peer is kicked, so it
//! reconnects and resyncs from its cursor instead of silently missing
//! updates.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbox full; the peer has been kicked.
    Lagging,
    /// Connection already gone.
    Closed,
}

/// Sending side of one connection's outbox.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<Arc<Vec<u8>>>,
    kick: Arc<Notify>,
}

/// Receiving side, owned by the connection task.
#[derive(Debug)]
pub struct PeerMailbox {
    pub frames: mpsc::Receiver<Arc<Vec<u8>>>,
    pub kicked: Arc<Notify>,
}

impl PeerHandle {
    pub fn new(capacity: usize) -> (Self, PeerMailbox) {
        let (outbox, frames) = mpsc::channel(capacity.max(1));
        let kick = Arc::new(Notify::new());
        let handle = Self {
            id: Uuid::new_v4(),
            outbox,
            kick: kick.clone(),
        };
        (handle, PeerMailbox { frames, kicked: kick })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: Arc<Vec<u8>>) -> Delivery {
        match self.outbox.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Peer {} is lagging, disconnecting", self.id);
                self.kick.notify_one();
                Delivery::Lagging
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Subscribed connections of one document room.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    members: HashMap<ConnectionId, PeerHandle>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the connection was already a member.
    pub fn add_member(&mut self, peer: PeerHandle) -> bool {
        self.members.insert(peer.id(), peer).is_none()
    }

    pub fn remove_member(&mut self, id: &ConnectionId) -> Option<PeerHandle> {
        self.members.remove(id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send a pre-encoded frame to every member except `except`.
    ///
    /// Returns the number of outboxes the frame was queued in.
    pub fn broadcast(&self, frame: Arc<Vec<u8>>, except: Option<ConnectionId>) -> usize {
        let mut queued = 0;
        for (id, peer) in &self.members {
            if Some(*id) == except {
                continue;
            }
            if peer.deliver(frame.clone()) == Delivery::Queued {
                queued += 1;
            }
        }
        queued
    }
}

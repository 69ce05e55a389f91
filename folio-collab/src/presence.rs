//! Presence payloads carried inside `AwarenessUpdate` frames.
//!
//! ## Architecture
//!
//! ```text
//! Local caret / status change
//!       │
//!       ▼
//! LocalPresence::set()          (clock += 1)
//!       │
//!       ▼
//! PresenceUpdate ── bincode ──► AwarenessUpdate.payload
//!       │
//!       ▼   (relayed by the server, never persisted)
//! Remote PresenceTable::apply() (last writer wins per client)
//!       │
//!       ▼
//! PresenceTable::remove_idle()  (peers that stopped heart-beating)
//! ```
//!
//! Every entry carries a per-client clock. A higher clock replaces the
//! stored state, an equal clock is a heartbeat that only refreshes the
//! entry's liveness, and a lower clock is stale and ignored. Entries whose
//! client stops heart-beating are dropped by [`PresenceTable::remove_idle`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default idle timeout: three missed 15-second heartbeats.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

/// One client's presence at a given clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub clock: u64,
    /// Opaque state (caret, selection, status). `None` means the client left.
    pub state: Option<String>,
}

/// Payload of an `AwarenessUpdate` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub entries: Vec<PresenceEntry>,
}

impl PresenceUpdate {
    pub fn single(entry: PresenceEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PeerPresence {
    clock: u64,
    state: String,
    last_seen: Instant,
}

/// What a single [`PresenceTable::apply`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    /// Clients whose state was inserted or replaced.
    pub updated: Vec<u64>,
    /// Clients that announced they left.
    pub removed: Vec<u64>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence of every remote client viewing a document.
#[derive(Debug, Clone)]
pub struct PresenceTable {
    peers: HashMap<u64, PeerPresence>,
    /// Highest clock seen per client, kept after removal so a delayed
    /// packet cannot resurrect a client that left.
    clocks: HashMap<u64, u64>,
    idle_timeout: Duration,
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl PresenceTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            clocks: HashMap::new(),
            idle_timeout,
        }
    }

    pub fn apply(&mut self, update: &PresenceUpdate) -> PresenceChange {
        self.apply_at(update, Instant::now())
    }

    /// Merge an update observed at `now`.
    pub fn apply_at(&mut self, update: &PresenceUpdate, now: Instant) -> PresenceChange {
        let mut change = PresenceChange::default();
        for entry in &update.entries {
            let known = self.clocks.get(&entry.client_id).copied();
            if known.is_some_and(|clock| entry.clock < clock) {
                log::trace!("Stale presence for client {} ignored", entry.client_id);
                continue;
            }
            let heartbeat = known == Some(entry.clock);
            self.clocks.insert(entry.client_id, entry.clock);

            match &entry.state {
                None => {
                    if self.peers.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
                Some(state) => {
                    if heartbeat {
                        if let Some(peer) = self.peers.get_mut(&entry.client_id) {
                            peer.last_seen = now;
                            continue;
                        }
                    }
                    self.peers.insert(
                        entry.client_id,
                        PeerPresence {
                            clock: entry.clock,
                            state: state.clone(),
                            last_seen: now,
                        },
                    );
                    change.updated.push(entry.client_id);
                }
            }
        }
        change
    }

    /// Drop clients not heard from within the idle timeout.
    pub fn remove_idle(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.idle_timeout;
        let idle: Vec<u64> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    pub fn state(&self, client_id: u64) -> Option<&str> {
        self.peers.get(&client_id).map(|p| p.state.as_str())
    }

    pub fn clock(&self, client_id: u64) -> Option<u64> {
        self.peers.get(&client_id).map(|p| p.clock)
    }

    /// `(client_id, state)` for every live client.
    pub fn peers(&self) -> impl Iterator<Item = (u64, &str)> {
        self.peers.iter().map(|(id, p)| (*id, p.state.as_str()))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local state
// ───────────────────────────────────────────────────────────────────

/// Builds this client's outgoing presence payloads.
#[derive(Debug, Clone)]
pub struct LocalPresence {
    client_id: u64,
    clock: u64,
    state: Option<String>,
}

impl LocalPresence {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            clock: 0,
            state: None,
        }
    }

    /// Random client id; collisions between viewers are negligible.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Record a new local state.
    pub fn set(&mut self, state: impl Into<String>) -> PresenceUpdate {
        self.clock += 1;
        self.state = Some(state.into());
        self.current()
    }

    /// Announce departure.
    pub fn leave(&mut self) -> PresenceUpdate {
        self.clock += 1;
        self.state = None;
        self.current()
    }

    /// The latest update at the current clock (re-sending it is a heartbeat).
    pub fn current(&self) -> PresenceUpdate {
        PresenceUpdate::single(PresenceEntry {
            client_id: self.client_id,
            clock: self.clock,
            state: self.state.clone(),
        })
    }
}

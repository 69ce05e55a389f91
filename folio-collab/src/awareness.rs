//! Awareness channel for one document.
//!
//! Inbound awareness is handed to the engine as-is: no cursor, no dedup,
//! no handshake gating. Outbound, the last local payload is re-sent on a
//! heartbeat so peers can tell a quiet viewer from a departed one.

use std::time::{Duration, Instant};

use crate::crdt::{CrdtEngine, CrdtError};
use crate::protocol::AwarenessUpdate;

/// Default re-send interval for the local awareness state.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AwarenessChannel {
    heartbeat: Duration,
    local: Option<Vec<u8>>,
    last_sent: Option<Instant>,
}

impl Default for AwarenessChannel {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT)
    }
}

impl AwarenessChannel {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            local: None,
            last_sent: None,
        }
    }

    /// Apply a peer's awareness payload.
    pub fn on_remote<E: CrdtEngine + ?Sized>(
        &self,
        engine: &mut E,
        update: &AwarenessUpdate,
    ) -> Result<(), CrdtError> {
        engine.apply_awareness_update(&update.payload)
    }

    /// Record and send a new local state.
    pub fn set_local(&mut self, payload: Vec<u8>, now: Instant) -> AwarenessUpdate {
        self.local = Some(payload.clone());
        self.last_sent = Some(now);
        AwarenessUpdate { payload }
    }

    /// The local state again, if the heartbeat interval has passed.
    pub fn heartbeat_due(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let last = self.last_sent?;
        if now.saturating_duration_since(last) < self.heartbeat {
            return None;
        }
        self.resend(now)
    }

    /// The local state again regardless of timing (after reconnecting).
    pub fn reannounce(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        self.resend(now)
    }

    fn resend(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let payload = self.local.clone()?;
        self.last_sent = Some(now);
        Some(AwarenessUpdate { payload })
    }

    pub fn local(&self) -> Option<&[u8]> {
        self.local.as_deref()
    }
}

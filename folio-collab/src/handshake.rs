//! Per-document sync handshake.
//!
//! ```text
//!            begin()                 on_reply()
//!   Idle ──────────────► AwaitingReply ──────────► Synced
//!    ▲                     │    ▲
//!    │ cancel()            │    │ poll_timeout(): re-send with backoff
//!    │                     ▼    │
//!    └──────────────────  Failed (ceiling passed, still retrying)
//!
//!   close() from any state ──► Closed
//! ```
//!
//! A round starts by sending `SyncRequest{cursor, state_vector}`. It ends
//! when an `Update` flagged `SYNC_REPLY` arrives (an empty one means the
//! replica was already up to date). Unanswered requests are re-sent on a
//! backoff schedule; after `stall_after` retries the round is reported as
//! stalled and after `max_retries` as failed. Retries never stop while the
//! document stays open and connected.

use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::crdt::{CrdtEngine, CrdtError};
use crate::protocol::{SyncRequest, Update, UpdateFlags};
use crate::rid::Rid;

#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeConfig {
    /// How long to wait for a reply before re-sending.
    pub reply_timeout: Duration,
    /// Extra wait added per retry.
    pub retry_backoff: Backoff,
    /// Retries before the round is reported as stalled ("syncing…").
    pub stall_after: u32,
    /// Retries before the round is reported as failed ("unable to sync").
    pub max_retries: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            retry_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
            stall_after: 3,
            max_retries: 8,
        }
    }
}

impl HandshakeConfig {
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_stall_after(mut self, retries: u32) -> Self {
        self.stall_after = retries;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingReply,
    Synced,
    /// Past the retry ceiling; requests are still being re-sent.
    Failed,
    Closed,
}

/// What a timed-out round should surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Re-send quietly.
    Retry,
    /// Re-send and report the document as still syncing.
    Stalled,
    /// Re-send and report that syncing is failing.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRetry {
    /// Retries so far in this round, including this one.
    pub retries: u32,
    pub verdict: RetryVerdict,
}

#[derive(Debug, Clone)]
pub struct SyncHandshake {
    config: HandshakeConfig,
    state: HandshakeState,
    retries: u32,
    deadline: Option<Instant>,
}

impl SyncHandshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Idle,
            retries: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == HandshakeState::Synced
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start a fresh round. Any round in flight is superseded.
    pub fn begin(&mut self, now: Instant, cursor: Rid, state_vector: Vec<u8>) -> SyncRequest {
        self.state = HandshakeState::AwaitingReply;
        self.retries = 0;
        self.deadline = Some(now + self.config.reply_timeout);
        SyncRequest {
            last_message_id: cursor,
            state_vector,
        }
    }

    /// A `SYNC_REPLY` update arrived and was handled.
    ///
    /// Returns `true` if this completed a round.
    pub fn on_reply(&mut self) -> bool {
        match self.state {
            HandshakeState::AwaitingReply | HandshakeState::Failed => {
                self.state = HandshakeState::Synced;
                self.retries = 0;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Check the reply deadline. On expiry, schedules the next one and
    /// tells the caller to re-send the request.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<HandshakeRetry> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.retries += 1;
        let wait = self.config.reply_timeout + self.config.retry_backoff.delay(self.retries);
        self.deadline = Some(now + wait);

        let verdict = if self.retries == self.config.max_retries {
            self.state = HandshakeState::Failed;
            RetryVerdict::Failed
        } else if self.retries == self.config.stall_after {
            RetryVerdict::Stalled
        } else {
            RetryVerdict::Retry
        };
        log::debug!(
            "Sync request unanswered, retry {} ({verdict:?})",
            self.retries
        );
        Some(HandshakeRetry {
            retries: self.retries,
            verdict,
        })
    }

    /// Stop waiting (connection dropped). A later `begin` restarts.
    pub fn cancel(&mut self) {
        if self.state != HandshakeState::Closed {
            self.state = HandshakeState::Idle;
        }
        self.deadline = None;
    }

    /// Subscription closed. Only `reopen` leaves this state.
    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
        self.deadline = None;
        self.retries = 0;
    }

    pub fn reopen(&mut self) {
        if self.state == HandshakeState::Closed {
            self.state = HandshakeState::Idle;
        }
    }
}

/// Answer a peer's `SyncRequest` with the delta it is missing.
///
/// The stream authority passes a fresh `Rid`; any other party passes
/// `Rid::ZERO` and lets the authority stamp it.
pub fn reply_to<E: CrdtEngine + ?Sized>(
    request: &SyncRequest,
    engine: &E,
    message_id: Rid,
) -> Result<Update, CrdtError> {
    let payload = engine.update_since(&request.state_vector)?;
    Ok(Update {
        message_id,
        flags: UpdateFlags::SYNC_REPLY,
        payload,
    })
}

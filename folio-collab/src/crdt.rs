//! The replica seam between the sync protocol and the CRDT.
//!
//! The protocol never looks inside updates or state vectors. It only
//! needs the four operations of [`CrdtEngine`]. [`YrsDocument`] provides
//! them on top of a `yrs::Doc` plus a [`PresenceTable`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, Transact};

use crate::presence::{PresenceChange, PresenceTable, PresenceUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update could not be integrated: {0}")]
    Rejected(String),
    #[error("malformed awareness payload: {0}")]
    MalformedAwareness(String),
}

/// A document replica as seen by the sync protocol.
pub trait CrdtEngine: Send {
    /// Opaque summary of the replica's content.
    fn state_vector(&self) -> Vec<u8>;

    /// Integrate a remote delta or snapshot.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError>;

    /// The delta a peer with `state_vector` is missing.
    fn update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError>;

    /// Merge ephemeral presence state.
    fn apply_awareness_update(&mut self, payload: &[u8]) -> Result<(), CrdtError>;

    /// Drop presence of peers that stopped heart-beating, returning their
    /// client ids. Engines that keep no presence have nothing to drop.
    fn remove_idle_presence(&mut self, _now: Instant) -> Vec<u64> {
        Vec::new()
    }
}

impl<E: CrdtEngine + ?Sized> CrdtEngine for Box<E> {
    fn state_vector(&self) -> Vec<u8> {
        (**self).state_vector()
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        (**self).apply_update(update)
    }

    fn update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        (**self).update_since(state_vector)
    }

    fn apply_awareness_update(&mut self, payload: &[u8]) -> Result<(), CrdtError> {
        (**self).apply_awareness_update(payload)
    }

    fn remove_idle_presence(&mut self, now: Instant) -> Vec<u64> {
        (**self).remove_idle_presence(now)
    }
}

// ───────────────────────────────────────────────────────────────────
// yrs-backed replica
// ───────────────────────────────────────────────────────────────────

struct DocState {
    doc: yrs::Doc,
    presence: PresenceTable,
}

/// Shared handle to a yrs replica.
///
/// Clones share the same document: the host keeps one to edit and read,
/// the sync session owns another. Every access is serialized through one
/// lock, so a remote update never interleaves with a local transaction.
#[derive(Clone)]
pub struct YrsDocument {
    inner: Arc<Mutex<DocState>>,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        Self::from_doc(yrs::Doc::new())
    }

    pub fn from_doc(doc: yrs::Doc) -> Self {
        Self::with_presence(doc, PresenceTable::default())
    }

    pub fn with_presence(doc: yrs::Doc, presence: PresenceTable) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DocState { doc, presence })),
        }
    }

    /// Restore a replica from a full-state update.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let mut doc = Self::new();
        doc.apply_update(snapshot)?;
        Ok(doc)
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        // A panic inside a host closure must not brick the replica.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a local edit and return the delta it produced.
    pub fn edit<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut yrs::TransactionMut<'_>),
    {
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        f(&mut txn);
        txn.encode_update_v1()
    }

    /// Read from the document.
    pub fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&yrs::Transaction<'_>) -> R,
    {
        let state = self.lock();
        let txn = state.doc.transact();
        f(&txn)
    }

    /// Contents of a root-level text, empty if it does not exist.
    pub fn text(&self, name: &str) -> String {
        self.read(|txn| {
            txn.get_text(name)
                .map(|text| text.get_string(txn))
                .unwrap_or_default()
        })
    }

    /// Full state encoded as a single update.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.lock();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Run `f` against the presence table.
    pub fn presence<R>(&self, f: impl FnOnce(&mut PresenceTable) -> R) -> R {
        let mut state = self.lock();
        f(&mut state.presence)
    }

    /// Merge presence and report what changed.
    pub fn merge_presence(&self, payload: &[u8]) -> Result<PresenceChange, CrdtError> {
        let update = PresenceUpdate::decode(payload).map_err(CrdtError::MalformedAwareness)?;
        Ok(self.presence(|table| table.apply(&update)))
    }
}

impl CrdtEngine for YrsDocument {
    fn state_vector(&self) -> Vec<u8> {
        let state = self.lock();
        let txn = state.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        let update =
            yrs::Update::decode_v1(update).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CrdtError::Rejected(e.to_string()))
    }

    fn update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = yrs::StateVector::decode_v1(state_vector)
            .map_err(|e| CrdtError::MalformedStateVector(e.to_string()))?;
        let state = self.lock();
        let txn = state.doc.transact();
        let diff = txn.encode_diff_v1(&sv);
        // yrs encodes "nothing missing" as a non-empty frame; the protocol
        // wants an empty payload for an up-to-date peer.
        let update =
            yrs::Update::decode_v1(&diff).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        if update.is_empty() {
            return Ok(Vec::new());
        }
        Ok(diff)
    }

    fn apply_awareness_update(&mut self, payload: &[u8]) -> Result<(), CrdtError> {
        self.merge_presence(payload).map(drop)
    }

    fn remove_idle_presence(&mut self, now: Instant) -> Vec<u64> {
        self.presence(|table| table.remove_idle(now))
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("YrsDocument")
            .field("client_id", &state.doc.client_id())
            .field("presence", &state.presence.len())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Test double
// ───────────────────────────────────────────────────────────────────

/// Records every call so protocol tests can count applications.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingEngine {
    pub applied: Vec<Vec<u8>>,
    pub awareness: Vec<Vec<u8>>,
    pub fail_next_apply: bool,
}

#[cfg(test)]
impl CrdtEngine for RecordingEngine {
    fn state_vector(&self) -> Vec<u8> {
        vec![self.applied.len() as u8]
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        if std::mem::take(&mut self.fail_next_apply) {
            return Err(CrdtError::MalformedUpdate("test failure".into()));
        }
        self.applied.push(update.to_vec());
        Ok(())
    }

    fn update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let seen = state_vector.first().copied().unwrap_or(0) as usize;
        Ok(self.applied.iter().skip(seen).flatten().copied().collect())
    }

    fn apply_awareness_update(&mut self, payload: &[u8]) -> Result<(), CrdtError> {
        self.awareness.push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::LocalPresence;
    use yrs::{GetString, Text, WriteTxn};

    fn insert(doc: &YrsDocument, at: u32, s: &str) -> Vec<u8> {
        doc.edit(|txn| {
            let text = txn.get_or_insert_text("body");
            text.insert(txn, at, s);
        })
    }

    #[test]
    fn test_edit_produces_applicable_delta() {
        let a = YrsDocument::new();
        let mut b = YrsDocument::new();
        let delta = insert(&a, 0, "hello");
        b.apply_update(&delta).unwrap();
        assert_eq!(b.text("body"), "hello");
    }

    #[test]
    fn test_update_since_transfers_missing_state() {
        let a = YrsDocument::new();
        insert(&a, 0, "abc");
        let mut b = YrsDocument::new();
        let diff = a.update_since(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();
        assert_eq!(b.text("body"), "abc");

        // Nothing left to transfer.
        assert!(a.update_since(&b.state_vector()).unwrap().is_empty());
    }

    #[test]
    fn test_update_since_empty_when_up_to_date() {
        let fresh = YrsDocument::new();
        assert!(fresh.update_since(&YrsDocument::new().state_vector()).unwrap().is_empty());

        let a = YrsDocument::new();
        insert(&a, 0, "abc");
        assert!(a.update_since(&a.state_vector()).unwrap().is_empty());
        assert!(!a.update_since(&fresh.state_vector()).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = YrsDocument::new();
        let mut b = YrsDocument::new();
        let da = insert(&a, 0, "left ");
        let db = insert(&b, 0, "right");
        a.apply_update(&db).unwrap();
        b.apply_update(&da).unwrap();
        assert_eq!(a.text("body"), b.text("body"));
    }

    #[test]
    fn test_snapshot_restores() {
        let a = YrsDocument::new();
        insert(&a, 0, "persist me");
        let restored = YrsDocument::from_snapshot(&a.snapshot()).unwrap();
        assert_eq!(restored.text("body"), "persist me");
    }

    #[test]
    fn test_malformed_inputs() {
        let mut doc = YrsDocument::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFF, 0xFF]),
            Err(CrdtError::MalformedUpdate(_))
        ));
        assert!(matches!(
            doc.update_since(&[0xFF, 0xFF, 0xFF]),
            Err(CrdtError::MalformedStateVector(_))
        ));
        assert!(matches!(
            doc.apply_awareness_update(&[0xFF, 0xFF, 0xFF]),
            Err(CrdtError::MalformedAwareness(_))
        ));
    }

    #[test]
    fn test_awareness_lands_in_presence_table() {
        let mut doc = YrsDocument::new();
        let mut local = LocalPresence::new(11);
        let payload = local.set("caret:4").encode().unwrap();
        doc.apply_awareness_update(&payload).unwrap();
        assert_eq!(doc.presence(|t| t.state(11).map(str::to_owned)), Some("caret:4".into()));
    }

    #[test]
    fn test_idle_presence_removed() {
        let mut doc = YrsDocument::with_presence(
            yrs::Doc::new(),
            PresenceTable::new(std::time::Duration::from_millis(50)),
        );
        let payload = LocalPresence::new(3).set("typing").encode().unwrap();
        doc.apply_awareness_update(&payload).unwrap();

        let later = Instant::now() + std::time::Duration::from_secs(1);
        assert_eq!(doc.remove_idle_presence(later), vec![3]);
        assert!(doc.presence(|t| t.is_empty()));
    }

    #[test]
    fn test_clones_share_state() {
        let a = YrsDocument::new();
        let b = a.clone();
        insert(&a, 0, "shared");
        assert_eq!(b.text("body"), "shared");
        let _ = b.read(|txn| txn.get_text("body").map(|t| t.get_string(txn)));
    }
}

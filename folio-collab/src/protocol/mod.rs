//! Binary envelope for document-sync traffic.
//!
//! Wire layout (protocol-buffer encoding, field numbers are frozen):
//! ```text
//! Message        { 1: CollabMessage collab | 2: WorkspaceNotification notification }
//! CollabMessage  { 1: string object_id, 2: int32 collab_type,
//!                  3: SyncRequest | 4: Update | 5: AwarenessUpdate | 6: AccessChanged }
//! Rid            { 1: fixed64 timestamp, 2: uint32 counter }
//! SyncRequest    { 1: Rid last_message_id, 2: bytes state_vector }
//! Update         { 1: Rid message_id, 2: uint32 flags, 3: bytes payload }
//! AwarenessUpdate{ 1: bytes payload }
//! AccessChanged  { 1: bool can_read, 2: bool can_write, 3: int32 reason }
//! ```
//!
//! Each oneof is a closed Rust enum. When a frame repeats oneof members the
//! last one wins; a frame with none is rejected. Unknown fields are skipped.

pub mod notification;
pub mod wire;

use thiserror::Error;

use crate::rid::Rid;
pub use notification::{
    MemberChanged, NotificationEvent, PermissionChanged, UserProfileChanged,
    WorkspaceNotification,
};
use wire::{WireMessage, WireReader, WireType, WireWriter};

/// Decode failures. Any of these makes the frame malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    InvalidWireType(u8),
    #[error("invalid field number {0}")]
    InvalidFieldNumber(u64),
    #[error("length-delimited field of {len} bytes exceeds limit of {max}")]
    LengthTooLarge { len: u64, max: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} carries no payload variant")]
    MissingVariant(&'static str),
}

// ───────────────────────────────────────────────────────────────────
// Enumerations carried as int32
// ───────────────────────────────────────────────────────────────────

/// Kind of collaborative object a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollabType {
    Document,
    Database,
    DatabaseRow,
    Folder,
    UserAwareness,
    /// A value this build does not know; preserved on re-encode.
    Other(i32),
}

impl CollabType {
    pub fn to_i32(self) -> i32 {
        match self {
            CollabType::Document => 0,
            CollabType::Database => 1,
            CollabType::DatabaseRow => 2,
            CollabType::Folder => 3,
            CollabType::UserAwareness => 4,
            CollabType::Other(v) => v,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => CollabType::Document,
            1 => CollabType::Database,
            2 => CollabType::DatabaseRow,
            3 => CollabType::Folder,
            4 => CollabType::UserAwareness,
            v => CollabType::Other(v),
        }
    }
}

impl Default for CollabType {
    fn default() -> Self {
        CollabType::Document
    }
}

/// Cause code attached to [`AccessChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessReason {
    Unspecified,
    PermissionChanged,
    RemovedFromWorkspace,
    ObjectDeleted,
    Other(i32),
}

impl AccessReason {
    pub fn to_i32(self) -> i32 {
        match self {
            AccessReason::Unspecified => 0,
            AccessReason::PermissionChanged => 1,
            AccessReason::RemovedFromWorkspace => 2,
            AccessReason::ObjectDeleted => 3,
            AccessReason::Other(v) => v,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => AccessReason::Unspecified,
            1 => AccessReason::PermissionChanged,
            2 => AccessReason::RemovedFromWorkspace,
            3 => AccessReason::ObjectDeleted,
            v => AccessReason::Other(v),
        }
    }
}

impl Default for AccessReason {
    fn default() -> Self {
        AccessReason::Unspecified
    }
}

/// Bit-field carried by [`Update`]. Unknown bits survive a round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);
    /// Payload is the full document state rather than an increment.
    pub const SNAPSHOT: UpdateFlags = UpdateFlags(1);
    /// Payload answers a `SyncRequest`. Empty payload: already up to date.
    pub const SYNC_REPLY: UpdateFlags = UpdateFlags(1 << 1);

    pub const fn from_bits(bits: u32) -> Self {
        UpdateFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: UpdateFlags) -> Self {
        UpdateFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: Self) -> Self {
        UpdateFlags(self.0 | rhs.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload messages
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Sender's last applied stream position.
    pub last_message_id: Rid,
    /// Opaque summary of the sender's replica.
    pub state_vector: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    /// `Rid::ZERO` until the stream authority admits the update.
    pub message_id: Rid,
    pub flags: UpdateFlags,
    pub payload: Vec<u8>,
}

impl Update {
    /// A locally authored delta awaiting a server-assigned position.
    pub fn local(payload: Vec<u8>) -> Self {
        Self {
            message_id: Rid::ZERO,
            flags: UpdateFlags::NONE,
            payload,
        }
    }

    pub fn is_sync_reply(&self) -> bool {
        self.flags.contains(UpdateFlags::SYNC_REPLY)
    }

    /// Explicit "nothing to send" answer to a `SyncRequest`.
    pub fn is_up_to_date(&self) -> bool {
        self.is_sync_reply() && self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessChanged {
    pub can_read: bool,
    pub can_write: bool,
    pub reason: AccessReason,
}

/// The oneof carried by a [`CollabMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabData {
    SyncRequest(SyncRequest),
    Update(Update),
    AwarenessUpdate(AwarenessUpdate),
    AccessChanged(AccessChanged),
}

impl CollabData {
    pub fn kind(&self) -> &'static str {
        match self {
            CollabData::SyncRequest(_) => "sync_request",
            CollabData::Update(_) => "update",
            CollabData::AwarenessUpdate(_) => "awareness_update",
            CollabData::AccessChanged(_) => "access_changed",
        }
    }
}

/// One document's traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabMessage {
    pub object_id: String,
    pub collab_type: CollabType,
    pub data: CollabData,
}

/// Outermost frame. One WebSocket binary message carries exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Collab(CollabMessage),
    Notification(WorkspaceNotification),
}

impl Message {
    pub fn collab(
        object_id: impl Into<String>,
        collab_type: CollabType,
        data: CollabData,
    ) -> Self {
        Message::Collab(CollabMessage {
            object_id: object_id.into(),
            collab_type,
            data,
        })
    }

    pub fn sync_request(
        object_id: impl Into<String>,
        collab_type: CollabType,
        last_message_id: Rid,
        state_vector: Vec<u8>,
    ) -> Self {
        Self::collab(
            object_id,
            collab_type,
            CollabData::SyncRequest(SyncRequest {
                last_message_id,
                state_vector,
            }),
        )
    }

    pub fn update(object_id: impl Into<String>, collab_type: CollabType, update: Update) -> Self {
        Self::collab(object_id, collab_type, CollabData::Update(update))
    }

    pub fn awareness(
        object_id: impl Into<String>,
        collab_type: CollabType,
        payload: Vec<u8>,
    ) -> Self {
        Self::collab(
            object_id,
            collab_type,
            CollabData::AwarenessUpdate(AwarenessUpdate { payload }),
        )
    }

    pub fn access_changed(
        object_id: impl Into<String>,
        collab_type: CollabType,
        access: AccessChanged,
    ) -> Self {
        Self::collab(object_id, collab_type, CollabData::AccessChanged(access))
    }

    /// Document this frame belongs to, if any.
    pub fn object_id(&self) -> Option<&str> {
        match self {
            Message::Collab(msg) => Some(&msg.object_id),
            Message::Notification(_) => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_wire()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_wire(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Field layouts
// ───────────────────────────────────────────────────────────────────

impl WireMessage for Rid {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.fixed64(1, self.timestamp);
        w.uint32(2, self.counter);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut rid = Rid::ZERO;
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Fixed64) => rid.timestamp = r.read_fixed64()?,
                (2, WireType::Varint) => rid.counter = r.read_uint32()?,
                _ => r.skip(wt)?,
            }
        }
        Ok(rid)
    }
}

impl WireMessage for SyncRequest {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.message(1, &self.last_message_id);
        w.bytes(2, &self.state_vector);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut req = SyncRequest::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => req.last_message_id = r.read_message()?,
                (2, WireType::Len) => req.state_vector = r.read_bytes()?.to_vec(),
                _ => r.skip(wt)?,
            }
        }
        Ok(req)
    }
}

impl WireMessage for Update {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.message(1, &self.message_id);
        w.uint32(2, self.flags.bits());
        w.bytes(3, &self.payload);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut update = Update::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => update.message_id = r.read_message()?,
                (2, WireType::Varint) => update.flags = UpdateFlags::from_bits(r.read_uint32()?),
                (3, WireType::Len) => update.payload = r.read_bytes()?.to_vec(),
                _ => r.skip(wt)?,
            }
        }
        Ok(update)
    }
}

impl WireMessage for AwarenessUpdate {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.bytes(1, &self.payload);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut update = AwarenessUpdate::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => update.payload = r.read_bytes()?.to_vec(),
                _ => r.skip(wt)?,
            }
        }
        Ok(update)
    }
}

impl WireMessage for AccessChanged {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.bool(1, self.can_read);
        w.bool(2, self.can_write);
        w.int32(3, self.reason.to_i32());
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut access = AccessChanged::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Varint) => access.can_read = r.read_bool()?,
                (2, WireType::Varint) => access.can_write = r.read_bool()?,
                (3, WireType::Varint) => access.reason = AccessReason::from_i32(r.read_int32()?),
                _ => r.skip(wt)?,
            }
        }
        Ok(access)
    }
}

impl WireMessage for CollabMessage {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.string(1, &self.object_id);
        w.int32(2, self.collab_type.to_i32());
        match &self.data {
            CollabData::SyncRequest(m) => w.message(3, m),
            CollabData::Update(m) => w.message(4, m),
            CollabData::AwarenessUpdate(m) => w.message(5, m),
            CollabData::AccessChanged(m) => w.message(6, m),
        }
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut object_id = String::new();
        let mut collab_type = CollabType::default();
        let mut data = None;
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => object_id = r.read_string()?,
                (2, WireType::Varint) => collab_type = CollabType::from_i32(r.read_int32()?),
                (3, WireType::Len) => data = Some(CollabData::SyncRequest(r.read_message()?)),
                (4, WireType::Len) => data = Some(CollabData::Update(r.read_message()?)),
                (5, WireType::Len) => data = Some(CollabData::AwarenessUpdate(r.read_message()?)),
                (6, WireType::Len) => data = Some(CollabData::AccessChanged(r.read_message()?)),
                _ => r.skip(wt)?,
            }
        }
        Ok(CollabMessage {
            object_id,
            collab_type,
            data: data.ok_or(ProtocolError::MissingVariant("CollabMessage"))?,
        })
    }
}

impl WireMessage for Message {
    fn encode_fields(&self, w: &mut WireWriter) {
        match self {
            Message::Collab(m) => w.message(1, m),
            Message::Notification(m) => w.message(2, m),
        }
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut message = None;
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => message = Some(Message::Collab(r.read_message()?)),
                (2, WireType::Len) => message = Some(Message::Notification(r.read_message()?)),
                _ => r.skip(wt)?,
            }
        }
        message.ok_or(ProtocolError::MissingVariant("Message"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        Message::decode(&msg.encode()).unwrap()
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let msg = Message::sync_request(
            "doc-1",
            CollabType::Document,
            Rid::new(1_700_000_000_123, 7),
            vec![1, 2, 3],
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_update_roundtrip_keeps_unknown_flag_bits() {
        let msg = Message::update(
            "row-9",
            CollabType::DatabaseRow,
            Update {
                message_id: Rid::new(5, 2),
                flags: UpdateFlags::SYNC_REPLY | UpdateFlags::from_bits(1 << 9),
                payload: vec![9; 300],
            },
        );
        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
        match decoded {
            Message::Collab(CollabMessage {
                data: CollabData::Update(u),
                ..
            }) => {
                assert!(u.is_sync_reply());
                assert_eq!(u.flags.bits(), 0b10_0000_0010);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_awareness_survives() {
        let msg = Message::awareness("doc", CollabType::Document, Vec::new());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_access_changed_negative_reason() {
        let msg = Message::access_changed(
            "doc",
            CollabType::Folder,
            AccessChanged {
                can_read: true,
                can_write: false,
                reason: AccessReason::Other(-4),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_unknown_collab_type_preserved() {
        let msg = Message::awareness("doc", CollabType::Other(77), vec![1]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_exact_bytes_for_update() {
        let msg = Message::update(
            "a",
            CollabType::Document,
            Update {
                message_id: Rid::new(1, 2),
                flags: UpdateFlags::NONE,
                payload: vec![0xAB],
            },
        );
        let expected = vec![
            0x0A, 0x15, // Message.1 collab, len 21
            0x0A, 0x01, b'a', // CollabMessage.1 object_id
            0x22, 0x10, // CollabMessage.4 update, len 16
            0x0A, 0x0B, // Update.1 message_id, len 11
            0x09, 1, 0, 0, 0, 0, 0, 0, 0, // Rid.1 fixed64 timestamp
            0x10, 0x02, // Rid.2 counter
            0x1A, 0x01, 0xAB, // Update.3 payload
        ];
        assert_eq!(msg.encode(), expected);
    }

    #[test]
    fn test_last_oneof_member_wins() {
        let first = Message::awareness("doc", CollabType::Document, vec![1]).encode();
        let second = Message::update("doc", CollabType::Document, Update::local(vec![2])).encode();
        let mut both = first.clone();
        both.extend_from_slice(&second);
        // Two field-1 entries: the second collab message replaces the first.
        let decoded = Message::decode(&both).unwrap();
        match decoded {
            Message::Collab(CollabMessage {
                data: CollabData::Update(u),
                ..
            }) => assert_eq!(u.payload, vec![2]),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_variant_is_malformed() {
        assert_eq!(
            Message::decode(&[]),
            Err(ProtocolError::MissingVariant("Message"))
        );
        // Message.1 holding a CollabMessage with only an object id.
        let bytes = [0x0A, 0x03, 0x0A, 0x01, b'x'];
        assert_eq!(
            Message::decode(&bytes),
            Err(ProtocolError::MissingVariant("CollabMessage"))
        );
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut bytes = Message::awareness("doc", CollabType::Document, vec![4]).encode();
        // Append field 15, varint 1.
        bytes.extend_from_slice(&[0x78, 0x01]);
        assert!(Message::decode(&bytes).is_ok());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Message::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_update_helpers() {
        let reply = Update {
            message_id: Rid::new(3, 0),
            flags: UpdateFlags::SYNC_REPLY,
            payload: Vec::new(),
        };
        assert!(reply.is_up_to_date());
        assert!(!Update::local(vec![1]).is_sync_reply());
        assert_eq!(
            (UpdateFlags::SNAPSHOT | UpdateFlags::SYNC_REPLY).without(UpdateFlags::SYNC_REPLY),
            UpdateFlags::SNAPSHOT
        );
    }

    #[test]
    fn test_object_id_accessor() {
        let msg = Message::awareness("doc-7", CollabType::Document, vec![]);
        assert_eq!(msg.object_id(), Some("doc-7"));
    }
}

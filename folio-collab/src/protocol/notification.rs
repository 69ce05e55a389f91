//! Workspace-level events that share the sync connection.
//!
//! ```text
//! WorkspaceNotification { 1: string workspace_id,
//!                         2: UserProfileChanged | 3: PermissionChanged | 4: MemberChanged }
//! UserProfileChanged    { 1: int64 uid, 2: string name, 3: string email }
//! PermissionChanged     { 1: string object_id, 2: int32 reason }
//! MemberChanged         { 1: int64 uid, 2: int32 role, 3: bool removed }
//! ```
//!
//! Clients surface these as-is; they never touch document state.

use super::wire::{WireMessage, WireReader, WireType, WireWriter};
use super::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceNotification {
    pub workspace_id: String,
    pub event: NotificationEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    ProfileChanged(UserProfileChanged),
    PermissionChanged(PermissionChanged),
    MemberChanged(MemberChanged),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfileChanged {
    pub uid: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionChanged {
    pub object_id: String,
    pub reason: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberChanged {
    pub uid: i64,
    pub role: i32,
    pub removed: bool,
}

impl WorkspaceNotification {
    pub fn new(workspace_id: impl Into<String>, event: NotificationEvent) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            event,
        }
    }
}

impl WireMessage for UserProfileChanged {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.int64(1, self.uid);
        w.string(2, &self.name);
        w.string(3, &self.email);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut out = UserProfileChanged::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Varint) => out.uid = r.read_int64()?,
                (2, WireType::Len) => out.name = r.read_string()?,
                (3, WireType::Len) => out.email = r.read_string()?,
                _ => r.skip(wt)?,
            }
        }
        Ok(out)
    }
}

impl WireMessage for PermissionChanged {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.string(1, &self.object_id);
        w.int32(2, self.reason);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut out = PermissionChanged::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => out.object_id = r.read_string()?,
                (2, WireType::Varint) => out.reason = r.read_int32()?,
                _ => r.skip(wt)?,
            }
        }
        Ok(out)
    }
}

impl WireMessage for MemberChanged {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.int64(1, self.uid);
        w.int32(2, self.role);
        w.bool(3, self.removed);
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut out = MemberChanged::default();
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Varint) => out.uid = r.read_int64()?,
                (2, WireType::Varint) => out.role = r.read_int32()?,
                (3, WireType::Varint) => out.removed = r.read_bool()?,
                _ => r.skip(wt)?,
            }
        }
        Ok(out)
    }
}

impl WireMessage for WorkspaceNotification {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.string(1, &self.workspace_id);
        match &self.event {
            NotificationEvent::ProfileChanged(e) => w.message(2, e),
            NotificationEvent::PermissionChanged(e) => w.message(3, e),
            NotificationEvent::MemberChanged(e) => w.message(4, e),
        }
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut workspace_id = String::new();
        let mut event = None;
        while let Some((field, wt)) = r.next_field()? {
            match (field, wt) {
                (1, WireType::Len) => workspace_id = r.read_string()?,
                (2, WireType::Len) => {
                    event = Some(NotificationEvent::ProfileChanged(r.read_message()?))
                }
                (3, WireType::Len) => {
                    event = Some(NotificationEvent::PermissionChanged(r.read_message()?))
                }
                (4, WireType::Len) => {
                    event = Some(NotificationEvent::MemberChanged(r.read_message()?))
                }
                _ => r.skip(wt)?,
            }
        }
        Ok(WorkspaceNotification {
            workspace_id,
            event: event.ok_or(ProtocolError::MissingVariant("WorkspaceNotification"))?,
        })
    }
}

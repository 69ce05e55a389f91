//! Per-document access state driven by `AccessChanged` frames.
//!
//! ```text
//!   (read, write) ──can_write=false──► (read, -)      edits held
//!        ▲  ▲                             │
//!        │  └──────can_write=true─────────┘            edits flushed
//!        │
//!        └── can_read=true ── (-, -) ◄── can_read=false   session torn down
//! ```

use crate::protocol::AccessChanged;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_read: bool,
    pub can_write: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
        }
    }
}

/// What an `AccessChanged` frame did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTransition {
    Unchanged,
    /// Still readable, no longer writable.
    ReadOnly,
    /// Writable again after being read-only.
    WriteRestored,
    /// No longer readable.
    Revoked,
    /// Readable again after being revoked.
    Restored { can_write: bool },
}

#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    caps: Capabilities,
}

impl AccessControl {
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn can_read(&self) -> bool {
        self.caps.can_read
    }

    /// Writing requires reading.
    pub fn can_write(&self) -> bool {
        self.caps.can_read && self.caps.can_write
    }

    pub fn is_revoked(&self) -> bool {
        !self.caps.can_read
    }

    pub fn on_access_changed(&mut self, change: &AccessChanged) -> AccessTransition {
        let before = self.caps;
        let after = Capabilities {
            can_read: change.can_read,
            can_write: change.can_read && change.can_write,
        };
        self.caps = after;

        match (before.can_read, after.can_read) {
            (true, false) => AccessTransition::Revoked,
            (false, true) => AccessTransition::Restored {
                can_write: after.can_write,
            },
            (false, false) => AccessTransition::Unchanged,
            (true, true) => match (before.can_write, after.can_write) {
                (true, false) => AccessTransition::ReadOnly,
                (false, true) => AccessTransition::WriteRestored,
                _ => AccessTransition::Unchanged,
            },
        }
    }
}

//! # folio-collab: collaborative-document synchronization
//!
//! Keeps a client's CRDT replica of a document consistent with a central
//! stream authority and with every other connected client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket    ┌──────────────┐
//! │ SyncClient   │ ◄────────────► │ SyncServer   │
//! │ (per user)   │  protobuf Msg  │ (authority)  │
//! └──────┬───────┘                └──────┬───────┘
//!        │ per document                  │ per document
//!        ▼                               ▼
//! ┌──────────────┐                ┌──────────────┐
//! │DocumentSession│               │ DocumentRoom │
//! │ handshake    │                │ RidGenerator │
//! │ dispatcher   │                │ Broadcast    │
//! │ awareness    │                │ DocumentStore│
//! │ access       │                └──────────────┘
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ CrdtEngine   │  (YrsDocument)
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`rid`]: stream positions and their total order
//! - [`protocol`]: message envelope and its protobuf encoding
//! - [`crdt`]: the replica seam and its `yrs` implementation
//! - [`handshake`]: state-vector exchange with timeout and retry
//! - [`dispatcher`]: cursor-gated update application, echo correlation
//! - [`awareness`] / [`presence`]: ephemeral presence state
//! - [`access`]: read/write capability tracking
//! - [`session`]: one document's sync state machine
//! - [`client`] / [`transport`]: connection management and reconnection
//! - [`server`] / [`broadcast`]: the stream authority and its fan-out
//! - [`storage`]: cursor persistence and the RocksDB document store

pub mod access;
pub mod awareness;
pub mod backoff;
pub mod broadcast;
pub mod client;
pub mod crdt;
pub mod dispatcher;
pub mod handshake;
pub mod presence;
pub mod protocol;
pub mod rid;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use backoff::Backoff;
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient};
pub use crdt::{CrdtEngine, CrdtError, YrsDocument};
pub use dispatcher::{DispatchError, OfflineQueue, UpdateDispatcher, UpdateOutcome};
pub use handshake::{HandshakeConfig, HandshakeState, SyncHandshake};
pub use protocol::{
    AccessChanged, AccessReason, CollabData, CollabMessage, CollabType, Message, ProtocolError,
    SyncRequest, Update, UpdateFlags, WorkspaceNotification,
};
pub use rid::{Rid, RidGenerator};
pub use server::{AccessPolicy, ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{DocumentSession, SessionError, SyncEvent};
pub use storage::{CursorStore, DocumentMetadata, DocumentStore, MemoryCursorStore, StoreConfig, StoreError};
pub use transport::{Transport, TransportError, WebSocketTransport};

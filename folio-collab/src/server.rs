//! WebSocket sync server: the stream authority for every document.
//!
//! ```text
//!   Client A ──┐                                   ┌──► Client A (echo)
//!              ├──► SyncServer ──► DocumentRoom ───┤
//!   Client B ──┘    assign Rid      persist         └──► Client B
//! ```
//!
//! A connection subscribes to a document by sending a `SyncRequest`. The
//! room answers with everything the client lacks, then asks the client for
//! everything the room lacks. Admitted updates get the next `Rid` of the
//! room's stream and are fanned out to every member, the origin included,
//! so all replicas observe one total order.
//!
//! Reference: Kleppmann et al. "Local-First Software" (2019), Section 4.3

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, ConnectionId, Delivery, PeerHandle, PeerMailbox};
use crate::crdt::{CrdtEngine, CrdtError, YrsDocument};
use crate::handshake::reply_to;
use crate::protocol::{
    AccessChanged, AccessReason, AwarenessUpdate, CollabData, CollabMessage, CollabType, Message,
    SyncRequest, Update, UpdateFlags, WorkspaceNotification,
};
use crate::rid::{Rid, RidGenerator};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("stored document is corrupt: {0}")]
    Crdt(#[from] CrdtError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener.
    pub bind_addr: String,
    /// Frames queued per connection before it counts as lagging.
    pub outbox_capacity: usize,
    /// RocksDB directory. `None` keeps documents in memory only.
    pub storage_path: Option<PathBuf>,
    /// Admitted updates between snapshots of a document.
    pub snapshot_every: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 1024,
            storage_path: None,
            snapshot_every: 100,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_snapshot_every(mut self, updates: u64) -> Self {
        self.snapshot_every = updates.max(1);
        self
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_rooms: usize,
    pub updates_admitted: u64,
    pub lagging_disconnects: u64,
}

/// What connections may do with one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    pub can_read: bool,
    pub can_write: bool,
    pub reason: AccessReason,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
            reason: AccessReason::Unspecified,
        }
    }
}

impl AccessPolicy {
    /// Writing is never granted without reading.
    pub fn new(can_read: bool, can_write: bool, reason: AccessReason) -> Self {
        Self {
            can_read,
            can_write: can_read && can_write,
            reason,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.can_read && self.can_write
    }

    fn to_message(self) -> AccessChanged {
        AccessChanged {
            can_read: self.can_read,
            can_write: self.can_write,
            reason: self.reason,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms
// ───────────────────────────────────────────────────────────────────

/// A document room holds the authoritative replica and its stream clock.
struct DocumentRoom {
    collab_type: CollabType,
    doc: YrsDocument,
    rids: RidGenerator,
    members: BroadcastGroup,
    since_snapshot: u64,
}

impl DocumentRoom {
    fn new(collab_type: CollabType) -> Self {
        Self {
            collab_type,
            doc: YrsDocument::new(),
            rids: RidGenerator::new(),
            members: BroadcastGroup::new(),
            since_snapshot: 0,
        }
    }

    /// Rebuild a room from its snapshot plus the updates appended after it.
    fn load(
        store: &DocumentStore,
        object_id: &str,
        collab_type: CollabType,
    ) -> Result<Self, ServerError> {
        let Some(meta) = store.load_metadata(object_id)? else {
            return Ok(Self::new(collab_type));
        };

        let mut doc = match store.load_snapshot(object_id)? {
            Some(snapshot) => YrsDocument::from_snapshot(&snapshot)?,
            None => YrsDocument::new(),
        };
        let tail = store.updates_since(object_id, meta.snapshot_head)?;
        for (rid, payload) in &tail {
            if let Err(e) = doc.apply_update(payload) {
                log::warn!("Skipping stored update {rid} of {object_id}: {e}");
            }
        }
        log::debug!(
            "Loaded {object_id}: snapshot at {}, {} updates replayed, head {}",
            meta.snapshot_head,
            tail.len(),
            meta.head
        );

        Ok(Self {
            collab_type: meta.collab_type(),
            doc,
            rids: RidGenerator::resume_from(meta.head),
            members: BroadcastGroup::new(),
            since_snapshot: tail.len() as u64,
        })
    }

    fn persist(
        &mut self,
        store: &DocumentStore,
        object_id: &str,
        rid: Rid,
        payload: &[u8],
        snapshot_every: u64,
    ) {
        if let Err(e) = store.append_update(object_id, self.collab_type, rid, payload) {
            log::warn!("Failed to persist update {rid} of {object_id}: {e}");
            return;
        }
        self.since_snapshot += 1;
        if self.since_snapshot >= snapshot_every {
            if let Err(e) = self.checkpoint(store, object_id) {
                log::warn!("Failed to snapshot {object_id}: {e}");
            }
        }
    }

    /// Next Rid for a frame that is not appended to the log.
    ///
    /// The head is still recorded: clients hold it as their cursor, so a
    /// restart must never issue it again.
    fn next_unlogged(&mut self, store: Option<&DocumentStore>, object_id: &str) -> Rid {
        let rid = self.rids.next();
        if let Some(store) = store {
            if let Err(e) = store.advance_head(object_id, self.collab_type, rid) {
                log::warn!("Failed to record head {rid} of {object_id}: {e}");
            }
        }
        rid
    }

    /// Fold the update log into a fresh snapshot.
    fn checkpoint(&mut self, store: &DocumentStore, object_id: &str) -> Result<(), StoreError> {
        let head = self.rids.head();
        store.save_snapshot(object_id, self.collab_type, head, &self.doc.snapshot())?;
        let compacted = store.compact_updates(object_id, head)?;
        self.since_snapshot = 0;
        log::debug!("Snapshot of {object_id} at {head}, {compacted} updates compacted");
        Ok(())
    }
}

fn room_entry<'a>(
    rooms: &'a mut HashMap<String, DocumentRoom>,
    store: Option<&DocumentStore>,
    object_id: &str,
    collab_type: CollabType,
) -> Result<&'a mut DocumentRoom, ServerError> {
    match rooms.entry(object_id.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let room = match store {
                Some(store) => DocumentRoom::load(store, object_id, collab_type)?,
                None => DocumentRoom::new(collab_type),
            };
            log::info!("Opened room for {object_id}");
            Ok(entry.insert(room))
        }
    }
}

fn send(peer: &PeerHandle, message: &Message) {
    peer.deliver(Arc::new(message.encode()));
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

struct Shared {
    config: ServerConfig,
    rooms: Mutex<HashMap<String, DocumentRoom>>,
    connections: Mutex<HashMap<ConnectionId, PeerHandle>>,
    policies: RwLock<HashMap<String, AccessPolicy>>,
    stats: RwLock<ServerStats>,
    store: Option<DocumentStore>,
}

/// The sync server. Clones share the same rooms.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening the document store if one is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig::new(path))?;
                log::info!("Persistent storage enabled at {}", path.display());
                Some(store)
            }
            None => None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                rooms: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                policies: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Restore every stored document into memory.
    ///
    /// Returns the number of documents recovered.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };

        let object_ids = store.list_documents()?;
        let mut rooms = self.shared.rooms.lock().await;
        let mut recovered = 0;

        for object_id in &object_ids {
            if rooms.contains_key(object_id) {
                continue;
            }
            match DocumentRoom::load(store, object_id, CollabType::default()) {
                Ok(room) => {
                    log::info!("Recovered {object_id} at {}", room.rids.head());
                    rooms.insert(object_id.clone(), room);
                    recovered += 1;
                }
                Err(e) => log::error!("Failed to recover {object_id}: {e}"),
            }
        }

        log::info!("Recovery complete: {recovered}/{} documents restored", object_ids.len());
        Ok(recovered)
    }

    /// Recover stored documents, bind, and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        let (peer, mailbox) = PeerHandle::new(self.shared.config.outbox_capacity);
        self.shared
            .connections
            .lock()
            .await
            .insert(peer.id(), peer.clone());
        {
            let mut s = self.shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut subscriptions = HashSet::new();
        let result = self.pump(ws_stream, &peer, mailbox, &mut subscriptions).await;

        self.shared.connections.lock().await.remove(&peer.id());
        self.leave_rooms(peer.id(), &subscriptions).await;
        {
            let mut s = self.shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection from {addr} closed");
        result
    }

    /// Multiplex inbound frames with the connection's outbox.
    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        peer: &PeerHandle,
        mut mailbox: PeerMailbox,
        subscriptions: &mut HashSet<String>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.on_frame(peer, subscriptions, &data).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_sender.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Text(_))) => {
                        log::warn!("Ignoring text frame from connection {}", peer.id());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket read from {} failed: {e}", peer.id());
                        break;
                    }
                },
                frame = mailbox.frames.recv() => match frame {
                    Some(frame) => ws_sender.send(WsMessage::Binary(frame.to_vec().into())).await?,
                    None => break,
                },
                _ = mailbox.kicked.notified() => {
                    self.shared.stats.write().await.lagging_disconnects += 1;
                    log::warn!("Disconnecting lagging connection {}", peer.id());
                    break;
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    async fn on_frame(&self, peer: &PeerHandle, subscriptions: &mut HashSet<String>, bytes: &[u8]) {
        let decoded = Message::decode(bytes);
        {
            let mut s = self.shared.stats.write().await;
            s.total_frames += 1;
            s.total_bytes += bytes.len() as u64;
            if decoded.is_err() {
                s.malformed_frames += 1;
            }
        }

        match decoded {
            Ok(Message::Collab(msg)) => self.on_collab(peer, subscriptions, msg).await,
            Ok(Message::Notification(_)) => {
                log::warn!("Ignoring notification sent by connection {}", peer.id());
            }
            Err(e) => log::warn!("Malformed frame from connection {}: {e}", peer.id()),
        }
    }

    async fn on_collab(
        &self,
        peer: &PeerHandle,
        subscriptions: &mut HashSet<String>,
        msg: CollabMessage,
    ) {
        let CollabMessage {
            object_id,
            collab_type,
            data,
        } = msg;

        match data {
            CollabData::SyncRequest(request) => {
                self.on_sync_request(peer, subscriptions, &object_id, collab_type, &request)
                    .await;
            }
            CollabData::Update(update) => {
                if subscriptions.contains(&object_id) {
                    self.on_update(peer, &object_id, update).await;
                } else {
                    log::warn!(
                        "Dropping update for {object_id} from unsubscribed connection {}",
                        peer.id()
                    );
                }
            }
            CollabData::AwarenessUpdate(awareness) => {
                if subscriptions.contains(&object_id) {
                    self.on_awareness(peer, &object_id, awareness).await;
                }
            }
            CollabData::AccessChanged(_) => {
                log::warn!(
                    "Ignoring access change for {object_id} sent by connection {}",
                    peer.id()
                );
            }
        }
    }

    async fn on_sync_request(
        &self,
        peer: &PeerHandle,
        subscriptions: &mut HashSet<String>,
        object_id: &str,
        collab_type: CollabType,
        request: &SyncRequest,
    ) {
        let policy = self.access_policy(object_id).await;
        let mut rooms = self.shared.rooms.lock().await;
        let room = match room_entry(&mut rooms, self.shared.store.as_ref(), object_id, collab_type) {
            Ok(room) => room,
            Err(e) => {
                log::error!("Failed to open {object_id}: {e}");
                return;
            }
        };

        // Revoked connections stay subscribed so a later grant reaches them.
        if room.members.add_member(peer.clone()) {
            log::debug!("Connection {} subscribed to {object_id}", peer.id());
        }
        subscriptions.insert(object_id.to_string());
        let collab_type = room.collab_type;

        if !policy.can_read {
            send(peer, &Message::access_changed(object_id, collab_type, policy.to_message()));
            return;
        }

        let rid = room.next_unlogged(self.shared.store.as_ref(), object_id);
        let reply = match reply_to(request, &room.doc, rid) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Bad sync request for {object_id} from {}: {e}", peer.id());
                return;
            }
        };
        send(peer, &Message::update(object_id, collab_type, reply));

        if policy.can_write {
            send(
                peer,
                &Message::sync_request(
                    object_id,
                    collab_type,
                    room.rids.head(),
                    room.doc.state_vector(),
                ),
            );
        } else {
            send(peer, &Message::access_changed(object_id, collab_type, policy.to_message()));
        }
    }

    async fn on_update(&self, peer: &PeerHandle, object_id: &str, update: Update) {
        let policy = self.access_policy(object_id).await;
        let mut rooms = self.shared.rooms.lock().await;
        let Some(room) = rooms.get_mut(object_id) else {
            return;
        };

        if !policy.can_write {
            log::debug!("Rejected update for {object_id} from {}: read-only", peer.id());
            send(
                peer,
                &Message::access_changed(object_id, room.collab_type, policy.to_message()),
            );
            return;
        }
        if update.payload.is_empty() {
            log::debug!("Connection {} reports {object_id} up to date", peer.id());
            return;
        }

        let before = update.is_sync_reply().then(|| room.doc.snapshot());
        if let Err(e) = room.doc.apply_update(&update.payload) {
            log::warn!("Rejected update for {object_id} from {}: {e}", peer.id());
            return;
        }
        let changed = before.map_or(true, |before| before != room.doc.snapshot());
        let flags = update.flags.without(UpdateFlags::SYNC_REPLY);

        if !changed {
            // Acknowledge so the origin can advance its cursor.
            log::debug!("Sync reply for {object_id} from {} carried nothing new", peer.id());
            let ack = Update {
                message_id: room.next_unlogged(self.shared.store.as_ref(), object_id),
                flags,
                payload: update.payload,
            };
            send(peer, &Message::update(object_id, room.collab_type, ack));
            return;
        }

        let rid = room.rids.next();
        let admitted = Update {
            message_id: rid,
            flags,
            payload: update.payload,
        };

        if let Some(store) = &self.shared.store {
            room.persist(
                store,
                object_id,
                rid,
                &admitted.payload,
                self.shared.config.snapshot_every,
            );
        }

        let frame = Arc::new(Message::update(object_id, room.collab_type, admitted).encode());
        let fanned_out = room.members.broadcast(frame, None);
        log::debug!("Admitted {rid} for {object_id}, delivered to {fanned_out} connections");
        drop(rooms);

        self.shared.stats.write().await.updates_admitted += 1;
    }

    async fn on_awareness(&self, peer: &PeerHandle, object_id: &str, awareness: AwarenessUpdate) {
        if !self.access_policy(object_id).await.can_read {
            return;
        }
        let rooms = self.shared.rooms.lock().await;
        let Some(room) = rooms.get(object_id) else {
            return;
        };
        let frame =
            Arc::new(Message::awareness(object_id, room.collab_type, awareness.payload).encode());
        let relayed = room.members.broadcast(frame, Some(peer.id()));
        log::trace!("Relayed awareness for {object_id} to {relayed} connections");
    }

    async fn leave_rooms(&self, id: ConnectionId, subscriptions: &HashSet<String>) {
        let mut rooms = self.shared.rooms.lock().await;
        for object_id in subscriptions {
            let Some(room) = rooms.get_mut(object_id) else {
                continue;
            };
            room.members.remove_member(&id);
            if !room.members.is_empty() {
                continue;
            }
            // Without a store the room is the only copy of the document.
            let Some(store) = &self.shared.store else {
                continue;
            };
            if let Err(e) = room.checkpoint(store, object_id) {
                log::error!("Failed to snapshot {object_id}, keeping it in memory: {e}");
                continue;
            }
            rooms.remove(object_id);
            log::info!("Evicted empty room {object_id}");
        }
    }

    // ─── Administration ──────────────────────────────────────────────

    /// Change what connections may do with a document and tell every
    /// subscribed connection.
    ///
    /// Returns the number of connections notified.
    pub async fn set_access(
        &self,
        object_id: &str,
        can_read: bool,
        can_write: bool,
        reason: AccessReason,
    ) -> usize {
        let policy = AccessPolicy::new(can_read, can_write, reason);
        {
            let mut policies = self.shared.policies.write().await;
            if policy.is_unrestricted() {
                policies.remove(object_id);
            } else {
                policies.insert(object_id.to_string(), policy);
            }
        }

        let rooms = self.shared.rooms.lock().await;
        let Some(room) = rooms.get(object_id) else {
            return 0;
        };
        let frame = Arc::new(
            Message::access_changed(object_id, room.collab_type, policy.to_message()).encode(),
        );
        let notified = room.members.broadcast(frame, None);
        log::info!(
            "Access to {object_id} set to read={} write={}, {notified} connections notified",
            policy.can_read,
            policy.can_write
        );
        notified
    }

    pub async fn access_policy(&self, object_id: &str) -> AccessPolicy {
        self.shared
            .policies
            .read()
            .await
            .get(object_id)
            .copied()
            .unwrap_or_default()
    }

    /// Send a workspace notification to every connection.
    pub async fn notify(&self, notification: WorkspaceNotification) -> usize {
        let frame = Arc::new(Message::Notification(notification).encode());
        let connections = self.shared.connections.lock().await;
        connections
            .values()
            .filter(|peer| peer.deliver(frame.clone()) == Delivery::Queued)
            .count()
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.lock().await.len();
        stats
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.lock().await.len()
    }

    pub async fn member_count(&self, object_id: &str) -> usize {
        self.shared
            .rooms
            .lock()
            .await
            .get(object_id)
            .map_or(0, |room| room.members.member_count())
    }

    /// Shared handle to a loaded document's authoritative replica.
    pub async fn document(&self, object_id: &str) -> Option<YrsDocument> {
        self.shared
            .rooms
            .lock()
            .await
            .get(object_id)
            .map(|room| room.doc.clone())
    }

    /// Last Rid assigned in a loaded document's stream.
    pub async fn head(&self, object_id: &str) -> Option<Rid> {
        self.shared
            .rooms
            .lock()
            .await
            .get(object_id)
            .map(|room| room.rids.head())
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.shared.config)
            .field("persistent", &self.shared.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use yrs::{Text, WriteTxn};

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn start(config: ServerConfig) -> (SyncServer, String) {
        let server = SyncServer::new(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, url)
    }

    async fn connect(url: &str) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    async fn send_msg(ws: &mut Client, msg: &Message) {
        ws.send(WsMessage::Binary(msg.encode().into())).await.unwrap();
    }

    async fn recv_msg(ws: &mut Client) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out")
                .unwrap()
                .unwrap();
            if let WsMessage::Binary(data) = frame {
                return Message::decode(&data).unwrap();
            }
        }
    }

    fn update_of(msg: Message) -> Update {
        match msg {
            Message::Collab(CollabMessage {
                data: CollabData::Update(update),
                ..
            }) => update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    fn edit(text: &str) -> Vec<u8> {
        let doc = YrsDocument::new();
        doc.edit(|txn| {
            let body = txn.get_or_insert_text("body");
            body.insert(txn, 0, text);
        })
    }

    #[test]
    fn test_config_builders() {
        let config = ServerConfig::default()
            .with_bind_addr("0.0.0.0:1")
            .with_outbox_capacity(0)
            .with_snapshot_every(0)
            .with_storage_path("/tmp/x");
        assert_eq!(config.bind_addr, "0.0.0.0:1");
        assert_eq!(config.outbox_capacity, 1);
        assert_eq!(config.snapshot_every, 1);
        assert!(config.storage_path.is_some());
    }

    #[test]
    fn test_policy_write_requires_read() {
        let policy = AccessPolicy::new(false, true, AccessReason::ObjectDeleted);
        assert!(!policy.can_write);
        assert!(!policy.is_unrestricted());
        assert!(AccessPolicy::default().is_unrestricted());
    }

    #[tokio::test]
    async fn test_sync_request_reply_and_counter_request() {
        let (server, url) = start(ServerConfig::default()).await;
        let mut ws = connect(&url).await;

        send_msg(&mut ws, &Message::sync_request("doc", CollabType::Document, Rid::ZERO, vec![0]))
            .await;

        let reply = update_of(recv_msg(&mut ws).await);
        assert!(reply.is_sync_reply());
        assert!(!reply.message_id.is_zero());

        match recv_msg(&mut ws).await {
            Message::Collab(CollabMessage {
                data: CollabData::SyncRequest(req),
                ..
            }) => assert_eq!(req.last_message_id, reply.message_id),
            other => panic!("expected sync request, got {other:?}"),
        }
        assert_eq!(server.member_count("doc").await, 1);
    }

    #[tokio::test]
    async fn test_update_is_echoed_with_fresh_rid() {
        let (server, url) = start(ServerConfig::default()).await;
        let mut ws = connect(&url).await;
        send_msg(&mut ws, &Message::sync_request("doc", CollabType::Document, Rid::ZERO, vec![0]))
            .await;
        let reply = update_of(recv_msg(&mut ws).await);
        let _server_request = recv_msg(&mut ws).await;

        let payload = edit("hello");
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, Update::local(payload.clone())))
            .await;

        let echo = update_of(recv_msg(&mut ws).await);
        assert!(echo.message_id > reply.message_id);
        assert_eq!(echo.payload, payload);
        assert!(!echo.is_sync_reply());

        let doc = server.document("doc").await.unwrap();
        assert_eq!(doc.text("body"), "hello");
        assert_eq!(server.stats().await.updates_admitted, 1);
    }

    #[tokio::test]
    async fn test_unchanged_sync_reply_acknowledged() {
        let (_server, url) = start(ServerConfig::default()).await;
        let mut ws = connect(&url).await;
        send_msg(&mut ws, &Message::sync_request("doc", CollabType::Document, Rid::ZERO, vec![0]))
            .await;
        let _ = recv_msg(&mut ws).await;
        let _ = recv_msg(&mut ws).await;

        let payload = edit("x");
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, Update::local(payload.clone())))
            .await;
        let first = update_of(recv_msg(&mut ws).await);

        // Same content again as a sync reply: nothing new, ack only.
        let again = Update {
            message_id: Rid::ZERO,
            flags: UpdateFlags::SYNC_REPLY,
            payload: payload.clone(),
        };
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, again)).await;
        let ack = update_of(recv_msg(&mut ws).await);
        assert!(ack.message_id > first.message_id);
        assert_eq!(ack.payload, payload);
        assert!(!ack.is_sync_reply());
    }

    #[tokio::test]
    async fn test_up_to_date_sync_reply_ignored() {
        let (server, url) = start(ServerConfig::default()).await;
        let mut ws = connect(&url).await;
        let client = YrsDocument::new();
        send_msg(
            &mut ws,
            &Message::sync_request("doc", CollabType::Document, Rid::ZERO, client.state_vector()),
        )
        .await;
        let _ = recv_msg(&mut ws).await;
        let request = match recv_msg(&mut ws).await {
            Message::Collab(CollabMessage {
                data: CollabData::SyncRequest(req),
                ..
            }) => req,
            other => panic!("expected sync request, got {other:?}"),
        };
        let head = server.head("doc").await.unwrap();

        let reply = reply_to(&request, &client, Rid::ZERO).unwrap();
        assert!(reply.payload.is_empty());
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, reply)).await;

        // The next frame is the echo of a real edit, not an ack.
        let payload = edit("after");
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, Update::local(payload.clone())))
            .await;
        let echo = update_of(recv_msg(&mut ws).await);
        assert_eq!(echo.payload, payload);
        assert_eq!(server.stats().await.updates_admitted, 1);
        assert!(echo.message_id > head);
    }

    #[tokio::test]
    async fn test_unlogged_rids_recorded_as_head() {
        let dir = tempfile::tempdir().unwrap();
        let (server, url) = start(ServerConfig::default().with_storage_path(dir.path())).await;
        let store = server.shared.store.as_ref().unwrap();
        let mut ws = connect(&url).await;

        send_msg(&mut ws, &Message::sync_request("doc", CollabType::Document, Rid::ZERO, vec![0]))
            .await;
        let reply = update_of(recv_msg(&mut ws).await);
        let _ = recv_msg(&mut ws).await;
        assert_eq!(store.load_metadata("doc").unwrap().unwrap().head, reply.message_id);

        let payload = edit("x");
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, Update::local(payload.clone())))
            .await;
        let _ = recv_msg(&mut ws).await;
        let again = Update {
            message_id: Rid::ZERO,
            flags: UpdateFlags::SYNC_REPLY,
            payload,
        };
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, again)).await;
        let ack = update_of(recv_msg(&mut ws).await);

        let meta = store.load_metadata("doc").unwrap().unwrap();
        assert_eq!(meta.head, ack.message_id);
        assert_eq!(meta.update_count, 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_update_and_garbage_dropped() {
        let (server, url) = start(ServerConfig::default()).await;
        let mut ws = connect(&url).await;
        send_msg(&mut ws, &Message::update("doc", CollabType::Document, Update::local(edit("x"))))
            .await;
        ws.send(WsMessage::Binary(vec![0xFF, 0xFF, 0xFF].into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(server.room_count().await, 0);
        let stats = server.stats().await;
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.updates_admitted, 0);
    }

    #[tokio::test]
    async fn test_read_denied_subscribes_without_content() {
        let (server, url) = start(ServerConfig::default()).await;
        server
            .set_access("doc", false, false, AccessReason::PermissionChanged)
            .await;
        let mut ws = connect(&url).await;
        send_msg(&mut ws, &Message::sync_request("doc", CollabType::Document, Rid::ZERO, vec![0]))
            .await;

        match recv_msg(&mut ws).await {
            Message::Collab(CollabMessage {
                data: CollabData::AccessChanged(change),
                ..
            }) => {
                assert!(!change.can_read);
                assert_eq!(change.reason, AccessReason::PermissionChanged);
            }
            other => panic!("expected access change, got {other:?}"),
        }
        assert_eq!(server.member_count("doc").await, 1);

        assert_eq!(
            server.set_access("doc", true, true, AccessReason::PermissionChanged).await,
            1
        );
        assert!(server.access_policy("doc").await.is_unrestricted());
    }
}

//! Duplex frame transport under the sync client.
//!
//! A [`Transport`] only knows how to open a connection. A live connection is
//! a pair of channels carrying whole encoded `Message` frames; the incoming
//! side closing is the drop signal.
//!
//! ```text
//!   SyncClient ── outgoing (Vec<u8>) ──► writer task ──► WebSocket
//!   SyncClient ◄── incoming (Vec<u8>) ── reader task ◄── WebSocket
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("connect timed out")]
    Timeout,
}

/// One open connection.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// Binary WebSocket frames, one `Message` per frame.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    channel_capacity: usize,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_capacity: 256,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.channel_capacity);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.channel_capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: dropping in_tx tells the client the connection is gone
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(WsMessage::Text(_)) => log::warn!("Ignoring text frame from {url}"),
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket read from {url} failed: {e}");
                        break;
                    }
                }
            }
        });

        log::info!("Connected to {}", self.url);
        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// In-process transport for tests: each `connect` hands the server side of
/// a fresh channel pair to a [`memory::MemoryListener`].
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::protocol::Message;

    const CAPACITY: usize = 1024;

    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        accept_tx: mpsc::UnboundedSender<RemoteEnd>,
        refusing: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, MemoryListener) {
            let (accept_tx, accept_rx) = mpsc::unbounded_channel();
            let transport = Self {
                accept_tx,
                refusing: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicUsize::new(0)),
            };
            (transport, MemoryListener { accept_rx })
        }

        /// Make subsequent connects fail (server down).
        pub fn set_refusing(&self, refusing: bool) {
            self.refusing.store(refusing, Ordering::SeqCst);
        }

        /// Connect attempts so far, successful or not.
        pub fn connect_attempts(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> Result<Connection, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refusing.load(Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    url: "memory".into(),
                    reason: "refused".into(),
                });
            }

            let (c2s_tx, c2s_rx) = mpsc::channel(CAPACITY);
            let (s2c_tx, s2c_rx) = mpsc::channel(CAPACITY);
            self.accept_tx
                .send(RemoteEnd {
                    inbound: c2s_rx,
                    outbound: s2c_tx,
                })
                .map_err(|_| TransportError::Connect {
                    url: "memory".into(),
                    reason: "listener dropped".into(),
                })?;
            Ok(Connection {
                outgoing: c2s_tx,
                incoming: s2c_rx,
            })
        }
    }

    #[derive(Debug)]
    pub struct MemoryListener {
        accept_rx: mpsc::UnboundedReceiver<RemoteEnd>,
    }

    impl MemoryListener {
        pub async fn accept(&mut self) -> Option<RemoteEnd> {
            self.accept_rx.recv().await
        }
    }

    /// Server side of one in-memory connection. Dropping it closes the
    /// connection for the client.
    #[derive(Debug)]
    pub struct RemoteEnd {
        inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<Vec<u8>>,
    }

    impl RemoteEnd {
        pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
            self.send_raw(message.encode()).await
        }

        pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| TransportError::Closed)
        }

        pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
            self.inbound.recv().await
        }

        /// Next well-formed frame from the client.
        pub async fn recv(&mut self) -> Option<Message> {
            while let Some(frame) = self.inbound.recv().await {
                match Message::decode(&frame) {
                    Ok(message) => return Some(message),
                    Err(e) => log::warn!("Malformed frame from client: {e}"),
                }
            }
            None
        }
    }
}

//! Reconnection tests over the in-memory transport.
//!
//! The test plays the server side by hand so it can drop the connection,
//! refuse reconnects, and count exactly what the client re-sends.

use folio_collab::backoff::Backoff;
use folio_collab::client::{ClientConfig, ConnectionState, SyncClient};
use folio_collab::crdt::YrsDocument;
use folio_collab::protocol::{CollabData, CollabType, Message, SyncRequest, Update, UpdateFlags};
use folio_collab::rid::Rid;
use folio_collab::session::SyncEvent;
use folio_collab::storage::{CursorStore, MemoryCursorStore};
use folio_collab::transport::memory::{MemoryListener, MemoryTransport, RemoteEnd};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use yrs::{Text, WriteTxn};

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_reconnect(
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40)).with_jitter(0.0),
        )
        .with_tick_interval(Duration::from_millis(10))
}

async fn accept(listener: &mut MemoryListener) -> RemoteEnd {
    timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("client never connected")
        .expect("listener closed")
}

async fn wait_for(events: &mut mpsc::Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return;
        }
    }
}

/// Everything the client sends within `window`.
async fn drain(remote: &mut RemoteEnd, window: Duration) -> Vec<Message> {
    let mut frames = Vec::new();
    let _ = timeout(window, async {
        while let Some(msg) = remote.recv().await {
            frames.push(msg);
        }
    })
    .await;
    frames
}

fn sync_requests(frames: &[Message]) -> HashMap<String, Vec<SyncRequest>> {
    let mut requests: HashMap<String, Vec<SyncRequest>> = HashMap::new();
    for frame in frames {
        if let Message::Collab(msg) = frame {
            if let CollabData::SyncRequest(request) = &msg.data {
                requests
                    .entry(msg.object_id.clone())
                    .or_default()
                    .push(request.clone());
            }
        }
    }
    requests
}

fn reply(object_id: &str, rid: Rid) -> Message {
    Message::update(
        object_id,
        CollabType::Document,
        Update {
            message_id: rid,
            flags: UpdateFlags::SYNC_REPLY,
            payload: Vec::new(),
        },
    )
}

#[tokio::test]
async fn test_reconnect_resends_one_request_per_document_with_cursor() {
    let (transport, mut listener) = MemoryTransport::new();
    let cursors = Arc::new(MemoryCursorStore::new());
    let (client, mut events) =
        SyncClient::start(config(), Arc::new(transport.clone()), cursors.clone());

    let mut remote = accept(&mut listener).await;
    for object_id in ["alpha", "beta"] {
        client
            .open_document(object_id, CollabType::Document, YrsDocument::new())
            .await
            .unwrap();
    }

    let first = sync_requests(&drain(&mut remote, Duration::from_millis(100)).await);
    assert_eq!(first["alpha"].len(), 1);
    assert_eq!(first["beta"].len(), 1);

    remote.send(&reply("alpha", Rid::new(10, 0))).await.unwrap();
    remote.send(&reply("beta", Rid::new(12, 3))).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { object_id } if object_id == "alpha")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { object_id } if object_id == "beta")).await;

    // Drop the connection and keep the server down for a few attempts.
    transport.set_refusing(true);
    drop(remote);
    wait_for(&mut events, |e| *e == SyncEvent::Disconnected).await;
    let before = transport.connect_attempts();
    let grew = timeout(Duration::from_secs(2), async {
        while transport.connect_attempts() < before + 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(grew.is_ok(), "client stopped retrying");
    assert_ne!(client.connection_state(), ConnectionState::Connected);

    let persisted_alpha = cursors.load("alpha").unwrap().unwrap();
    let persisted_beta = cursors.load("beta").unwrap().unwrap();
    assert_eq!(persisted_alpha, Rid::new(10, 0));
    assert_eq!(persisted_beta, Rid::new(12, 3));

    transport.set_refusing(false);
    let mut remote = accept(&mut listener).await;
    wait_for(&mut events, |e| *e == SyncEvent::Connected).await;

    let again = sync_requests(&drain(&mut remote, Duration::from_millis(200)).await);
    assert_eq!(again.len(), 2);
    assert_eq!(again["alpha"].len(), 1);
    assert_eq!(again["beta"].len(), 1);
    assert_eq!(again["alpha"][0].last_message_id, persisted_alpha);
    assert_eq!(again["beta"][0].last_message_id, persisted_beta);
}

#[tokio::test]
async fn test_edits_made_offline_sent_after_request() {
    let (transport, mut listener) = MemoryTransport::new();
    let (client, mut events) = SyncClient::start(
        config(),
        Arc::new(transport.clone()),
        Arc::new(MemoryCursorStore::new()),
    );
    let mut remote = accept(&mut listener).await;

    let doc = YrsDocument::new();
    client
        .open_document("doc", CollabType::Document, doc.clone())
        .await
        .unwrap();
    drain(&mut remote, Duration::from_millis(50)).await;
    remote.send(&reply("doc", Rid::new(1, 0))).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;

    transport.set_refusing(true);
    drop(remote);
    wait_for(&mut events, |e| *e == SyncEvent::Disconnected).await;

    let delta = doc.edit(|txn| {
        let body = txn.get_or_insert_text("body");
        body.insert(txn, 0, "offline");
    });
    client.apply_local_change("doc", delta.clone()).await.unwrap();

    transport.set_refusing(false);
    let mut remote = accept(&mut listener).await;
    let frames = drain(&mut remote, Duration::from_millis(200)).await;

    let kinds: Vec<&str> = frames
        .iter()
        .filter_map(|m| match m {
            Message::Collab(c) => Some(c.data.kind()),
            Message::Notification(_) => None,
        })
        .collect();
    assert_eq!(kinds, vec!["sync_request", "update"]);

    match &frames[1] {
        Message::Collab(c) => match &c.data {
            CollabData::Update(update) => {
                assert_eq!(update.payload, delta);
                assert!(update.message_id.is_zero());
            }
            other => panic!("expected update, got {other:?}"),
        },
        other => panic!("expected collab frame, got {other:?}"),
    }
}

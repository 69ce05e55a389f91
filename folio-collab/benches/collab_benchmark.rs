use criterion::{criterion_group, criterion_main, Criterion};
use folio_collab::broadcast::{BroadcastGroup, PeerHandle};
use folio_collab::crdt::{CrdtEngine, CrdtError, YrsDocument};
use folio_collab::dispatcher::{OfflineQueue, UpdateDispatcher, DEFAULT_HELD_CAPACITY};
use folio_collab::presence::{LocalPresence, PresenceTable, PresenceUpdate};
use folio_collab::protocol::{CollabType, Message, Update, UpdateFlags};
use folio_collab::rid::{Rid, RidGenerator};
use folio_collab::storage::{DocumentStore, MemoryCursorStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use yrs::{Text, WriteTxn};

/// Accepts everything; isolates dispatcher overhead from CRDT cost.
struct NullEngine;

impl CrdtEngine for NullEngine {
    fn state_vector(&self) -> Vec<u8> {
        Vec::new()
    }

    fn apply_update(&mut self, _update: &[u8]) -> Result<(), CrdtError> {
        Ok(())
    }

    fn update_since(&self, _state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        Ok(Vec::new())
    }

    fn apply_awareness_update(&mut self, _payload: &[u8]) -> Result<(), CrdtError> {
        Ok(())
    }
}

fn update_message(size: usize) -> Message {
    Message::update(
        "0f3c1a52-9d1e-4c55-a7a8-5b6a0e1d2f90",
        CollabType::Document,
        Update {
            message_id: Rid::new(1_700_000_000_000, 7),
            flags: UpdateFlags::NONE,
            payload: vec![0xAB; size],
        },
    )
}

// ─── Codec ───────────────────────────────────────────────────────────────────

fn bench_update_encode(c: &mut Criterion) {
    let msg = update_message(64);
    c.bench_function("update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = update_message(64).encode();
    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_update_decode_64k(c: &mut Criterion) {
    let encoded = update_message(64 * 1024).encode();
    c.bench_function("update_decode_64KB", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_sync_request_roundtrip(c: &mut Criterion) {
    let doc = YrsDocument::new();
    doc.edit(|txn| {
        let body = txn.get_or_insert_text("body");
        body.insert(txn, 0, "state vector source");
    });
    let sv = doc.state_vector();

    c.bench_function("sync_request_roundtrip", |b| {
        b.iter(|| {
            let msg = Message::sync_request("doc", CollabType::Document, Rid::new(1, 1), sv.clone());
            black_box(Message::decode(&msg.encode()).unwrap());
        })
    });
}

// ─── Ordering & dispatch ─────────────────────────────────────────────────────

fn bench_rid_generator(c: &mut Criterion) {
    let mut rids = RidGenerator::new();
    c.bench_function("rid_generator_next", |b| b.iter(|| black_box(rids.next())));
}

fn bench_dispatcher_apply(c: &mut Criterion) {
    let mut dispatcher =
        UpdateDispatcher::new("doc", Arc::new(MemoryCursorStore::new()), DEFAULT_HELD_CAPACITY);
    let mut engine = NullEngine;
    let mut counter = 0u32;

    c.bench_function("dispatcher_apply_in_order", |b| {
        b.iter(|| {
            counter += 1;
            let update = Update {
                message_id: Rid::new(1, counter),
                flags: UpdateFlags::NONE,
                payload: vec![1; 32],
            };
            black_box(dispatcher.on_update(&mut engine, &update).unwrap());
        })
    });
}

fn bench_dispatcher_duplicate(c: &mut Criterion) {
    let mut dispatcher =
        UpdateDispatcher::new("doc", Arc::new(MemoryCursorStore::new()), DEFAULT_HELD_CAPACITY);
    let mut engine = NullEngine;
    let head = Update {
        message_id: Rid::new(10, 0),
        flags: UpdateFlags::NONE,
        payload: vec![1; 32],
    };
    dispatcher.on_update(&mut engine, &head).unwrap();

    c.bench_function("dispatcher_reject_duplicate", |b| {
        b.iter(|| black_box(dispatcher.on_update(&mut engine, black_box(&head)).unwrap()))
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(DEFAULT_HELD_CAPACITY);
            for i in 0..1000u32 {
                queue.enqueue(i.to_le_bytes().to_vec());
            }
            black_box(queue.drain());
        })
    });
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

fn bench_broadcast_fanout(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut mailboxes = Vec::new();
    for _ in 0..100 {
        let (peer, mailbox) = PeerHandle::new(2048);
        group.add_member(peer);
        mailboxes.push(mailbox);
    }
    let frame = Arc::new(update_message(64).encode());

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                group.broadcast(frame.clone(), None);
            }
            for mailbox in &mut mailboxes {
                while mailbox.frames.try_recv().is_ok() {}
            }
        })
    });
}

// ─── Presence ────────────────────────────────────────────────────────────────

fn bench_presence_merge(c: &mut Criterion) {
    let updates: Vec<Vec<u8>> = (0..100u64)
        .map(|id| LocalPresence::new(id).set("cursor 10..12").encode().unwrap())
        .collect();

    c.bench_function("presence_merge_100_peers", |b| {
        b.iter(|| {
            let mut table = PresenceTable::default();
            for payload in &updates {
                let update = PresenceUpdate::decode(payload).unwrap();
                black_box(table.apply(&update));
            }
        })
    });
}

// ─── Storage ─────────────────────────────────────────────────────────────────

fn bench_store_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let mut rids = RidGenerator::new();
    let payload = vec![0x42; 256];

    c.bench_function("store_append_update_256B", |b| {
        b.iter(|| {
            store
                .append_update("doc", CollabType::Document, rids.next(), black_box(&payload))
                .unwrap();
        })
    });
}

fn bench_store_updates_since(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    for i in 0..1000u32 {
        store
            .append_update("doc", CollabType::Document, Rid::new(1, i + 1), &[0x42; 64])
            .unwrap();
    }

    c.bench_function("store_updates_since_1000", |b| {
        b.iter(|| black_box(store.updates_since("doc", Rid::ZERO).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_update_decode_64k,
    bench_sync_request_roundtrip,
    bench_rid_generator,
    bench_dispatcher_apply,
    bench_dispatcher_duplicate,
    bench_offline_queue,
    bench_broadcast_fanout,
    bench_presence_merge,
    bench_store_append,
    bench_store_updates_since,
);
criterion_main!(benches);

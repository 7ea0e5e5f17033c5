//! End-to-end sync tests: convergence, delivery guarantees, attribution,
//! undo locality, and a real WebSocket round trip.

mod common;

use std::time::Instant;

use common::{connected, session, settle, updates, wire, DOC_ID};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use wiki_collab::{
    client, ClientId, CollabConfig, CollabSession, ConnectionEvent, IdentityAttribution, Mutation,
    Replica, UserIdentity, WsTransport,
};

fn replica(user: &str) -> (Replica, IdentityAttribution) {
    let client = ClientId::random();
    (
        Replica::new(client),
        IdentityAttribution::new(client, UserIdentity::new(user)),
    )
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for perm in permutations(n - 1) {
        for slot in 0..=perm.len() {
            let mut p = perm.clone();
            p.insert(slot, n - 1);
            out.push(p);
        }
    }
    out
}

#[test]
fn test_convergence_under_every_delivery_order() {
    let (seed, mut seed_attr) = replica("seed");
    seed.apply_local(&Mutation::insert(0, "base"), &mut seed_attr).unwrap();
    let base = seed.encode_state();

    let (a, mut attr_a) = replica("alice");
    let (b, mut attr_b) = replica("bob");
    let (c, mut attr_c) = replica("carol");
    for r in [&a, &b, &c] {
        r.apply_remote(base.as_bytes()).unwrap();
    }

    // Concurrent edits at the same position plus a causal follow-up.
    let updates = vec![
        a.apply_local(&Mutation::insert(0, "A"), &mut attr_a).unwrap(),
        b.apply_local(&Mutation::insert(0, "B"), &mut attr_b).unwrap(),
        c.apply_local(&Mutation::delete(1, 2), &mut attr_c).unwrap(),
        a.apply_local(&Mutation::insert(1, "a"), &mut attr_a).unwrap(),
    ];

    let mut results = Vec::new();
    for order in permutations(updates.len()) {
        let fresh = Replica::new(ClientId::random());
        fresh.apply_remote(base.as_bytes()).unwrap();
        for i in order {
            fresh.apply_remote(updates[i].as_bytes()).unwrap();
        }
        results.push(fresh.snapshot());
    }

    assert_eq!(results.len(), 24);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(results[0].content.len(), "base".len() - 2 + 3);
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let (a, mut attr_a) = replica("alice");
    let (b, _) = replica("bob");

    let u1 = a.apply_local(&Mutation::insert(0, "one "), &mut attr_a).unwrap();
    let u2 = a.apply_local(&Mutation::insert(4, "two"), &mut attr_a).unwrap();

    for u in [&u1, &u2, &u1, &u2, &u2] {
        b.apply_remote(u.as_bytes()).unwrap();
    }
    assert_eq!(b.snapshot(), a.snapshot());
}

#[test]
fn test_observer_never_attributed() {
    let now = Instant::now();
    let (mut writer, writer_wire) = connected("writer", CollabConfig::default(), now);
    let (mut observer, observer_wire) = connected("observer", CollabConfig::default(), now);

    writer.edit(Mutation::insert(0, "page")).unwrap();
    settle(
        &mut [(&mut writer, &writer_wire), (&mut observer, &observer_wire)],
        now,
    );
    observer.set_selection(0, 4, now).unwrap();
    observer.set_selection(1, 2, now).unwrap();
    settle(
        &mut [(&mut writer, &writer_wire), (&mut observer, &observer_wire)],
        now,
    );

    let attribution = observer.attribution();
    assert_eq!(attribution.len(), 1);
    assert_eq!(attribution.user_for(writer.client_id()), Some("writer"));
    assert_eq!(attribution.user_for(observer.client_id()), None);
    assert_eq!(writer.attribution(), attribution);
}

#[test]
fn test_single_keystroke_attributes_exactly_once() {
    let now = Instant::now();
    let (mut alice, alice_wire) = connected("alice", CollabConfig::default(), now);
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);

    alice.edit(Mutation::insert(0, "x")).unwrap();
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);

    let attribution = bob.attribution();
    assert_eq!(attribution.len(), 1);
    assert_eq!(attribution.user_for(alice.client_id()), Some("alice"));
    assert!(alice.is_attributed());
    assert!(!bob.is_attributed());
}

#[test]
fn test_undo_only_reverts_local_edit() {
    let now = Instant::now();
    let (mut alice, alice_wire) = connected("alice", CollabConfig::default(), now);
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);

    alice.edit(Mutation::insert(0, "A")).unwrap();
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    bob.edit(Mutation::insert(1, "B")).unwrap();
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(alice.snapshot().content, "AB");

    assert!(alice.undo().is_some());
    assert_eq!(alice.snapshot().content, "B");
    assert!(alice.undo().is_none());

    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(bob.snapshot().content, "B");
}

#[test]
fn test_undo_with_concurrent_remote_edit() {
    let now = Instant::now();
    let (mut alice, alice_wire) = connected("alice", CollabConfig::default(), now);
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);
    alice.edit(Mutation::insert(0, "0123")).unwrap();
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);

    // Both edit the same base before seeing each other.
    alice.edit(Mutation::insert(1, "AAA")).unwrap();
    bob.edit(Mutation::insert(3, "BBB")).unwrap();
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(alice.snapshot().content, "0AAA12BBB3");
    assert_eq!(bob.snapshot().content, "0AAA12BBB3");

    assert!(alice.undo().is_some());
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(alice.snapshot().content, "012BBB3");
    assert_eq!(bob.snapshot().content, "012BBB3");
}

#[test]
fn test_offline_edits_replay_in_order_exactly_once() {
    let now = Instant::now();
    let mut alice = session("alice", CollabConfig::default());
    let mut bob = session("bob", CollabConfig::default());

    alice.edit(Mutation::insert(0, "a")).unwrap();
    alice.edit(Mutation::insert(1, "b")).unwrap();
    assert_eq!(alice.pending_updates(), 2);

    let (transport, alice_wire) = wire();
    assert_eq!(alice.connect(transport, now).unwrap(), 2);
    assert_eq!(alice.pending_updates(), 0);

    let frames = alice_wire.take();
    let shipped = updates(&frames);
    assert_eq!(shipped.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![1, 2]);

    // Apply only the updates, in order: U1 must be visible before U2.
    bob.replica().apply_remote(&shipped[0].1).unwrap();
    assert_eq!(bob.snapshot().content, "a");
    bob.replica().apply_remote(&shipped[1].1).unwrap();
    assert_eq!(bob.snapshot().content, "ab");

    // Nothing is resent on a later flush.
    alice.tick(now).unwrap();
    assert!(updates(&alice_wire.take()).is_empty());
}

#[test]
fn test_drop_mid_session_requeues_and_resyncs() {
    let now = Instant::now();
    let (mut alice, alice_wire) = connected("alice", CollabConfig::default(), now);
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);

    alice_wire.close();
    alice.edit(Mutation::insert(0, "lost?")).unwrap();
    assert!(!alice.is_connected());
    assert_eq!(alice.pending_updates(), 1);

    // Offline edits keep working against local state.
    alice.edit(Mutation::insert(5, " no")).unwrap();
    assert_eq!(alice.snapshot().content, "lost? no");

    let (transport, new_wire) = wire();
    assert_eq!(alice.connect(transport, now).unwrap(), 2);
    settle(&mut [(&mut alice, &new_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(bob.snapshot().content, "lost? no");
}

#[test]
fn test_queue_overflow_recovered_by_resync() {
    let now = Instant::now();
    let small = CollabConfig {
        offline_queue_capacity: 2,
        ..CollabConfig::default()
    };
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);
    let mut alice = session("alice", small);

    for (i, ch) in ["a", "b", "c", "d"].into_iter().enumerate() {
        alice.edit(Mutation::insert(i as u32, ch)).unwrap();
    }
    assert_eq!(alice.pending_updates(), 2);

    let (transport, alice_wire) = wire();
    assert_eq!(alice.connect(transport, now).unwrap(), 2);
    assert_eq!(updates(&alice_wire.peek()).len(), 2);

    // Bob answers the join with its own state vector and pulls "cd".
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);
    assert_eq!(bob.snapshot().content, "abcd");
}

#[test]
fn test_resync_handshake_recovers_missed_updates() {
    let now = Instant::now();
    let (mut alice, alice_wire) = connected("alice", CollabConfig::default(), now);
    alice.edit(Mutation::insert(0, "before bob")).unwrap();
    alice_wire.take();

    // Bob joins late; the state-vector exchange fills the gap.
    let (mut bob, bob_wire) = connected("bob", CollabConfig::default(), now);
    settle(&mut [(&mut alice, &alice_wire), (&mut bob, &bob_wire)], now);

    assert_eq!(bob.snapshot().content, "before bob");
    assert_eq!(alice.peers().len(), 1);
}

#[test]
fn test_frames_for_other_documents_ignored() {
    let now = Instant::now();
    let (mut alice, _alice_wire) = connected("alice", CollabConfig::default(), now);
    let mut stranger: CollabSession<common::RecordingTransport> = CollabSession::new(
        uuid::Uuid::new_v4(),
        UserIdentity::new("stranger"),
        CollabConfig::default(),
    );
    let (transport, stranger_wire) = wire();
    stranger.connect(transport, now).unwrap();
    stranger.edit(Mutation::insert(0, "elsewhere")).unwrap();

    common::deliver(&stranger_wire.take(), &mut alice, now);
    assert_eq!(alice.snapshot().content, "");
    assert_ne!(stranger.doc_id(), DOC_ID);
}

// ───────────────────────────────────────────────────────────────────
// WebSocket round trip
// ───────────────────────────────────────────────────────────────────

/// Minimal fan-out relay: every binary frame goes to every other socket.
async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, _) = broadcast::channel::<(usize, Vec<u8>)>(256);

    tokio::spawn(async move {
        let mut next_id = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let id = next_id;
            next_id += 1;
            let tx = tx.clone();
            let mut rx = tx.subscribe();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut writer, mut reader) = ws.split();
                tokio::spawn(async move {
                    while let Ok((from, data)) = rx.recv().await {
                        if from != id && writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                });
                while let Some(Ok(msg)) = reader.next().await {
                    if let Message::Binary(data) = msg {
                        let _ = tx.send((id, data.into()));
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn test_websocket_sessions_converge() {
    let url = start_relay().await;
    let doc_id = uuid::Uuid::new_v4();
    let now = Instant::now();

    let mut alice: CollabSession<WsTransport> =
        CollabSession::new(doc_id, UserIdentity::new("alice"), CollabConfig::default());
    let mut bob: CollabSession<WsTransport> =
        CollabSession::new(doc_id, UserIdentity::new("bob"), CollabConfig::default());

    let (alice_tx, mut alice_rx) = client::connect(&url, doc_id).await.unwrap();
    let (bob_tx, mut bob_rx) = client::connect(&url, doc_id).await.unwrap();
    alice.connect(alice_tx, now).unwrap();
    bob.connect(bob_tx, now).unwrap();

    alice.edit(Mutation::insert(0, "hello")).unwrap();
    bob.edit(Mutation::insert(0, "hi ")).unwrap();

    let synced = timeout(Duration::from_secs(5), async {
        loop {
            tokio::select! {
                Some(ConnectionEvent::Frame(frame)) = alice_rx.recv() => {
                    let _ = alice.handle_frame(&frame, Instant::now());
                }
                Some(ConnectionEvent::Frame(frame)) = bob_rx.recv() => {
                    let _ = bob.handle_frame(&frame, Instant::now());
                }
                else => break,
            }
            if alice.snapshot().content.len() == 8 && alice.snapshot() == bob.snapshot() {
                break;
            }
        }
    })
    .await;

    assert!(synced.is_ok(), "sessions did not converge over WebSocket");
    assert_eq!(alice.snapshot().content, bob.snapshot().content);
    assert_eq!(alice.attribution().len(), 2);
}

//! End-to-end tests: an authority with client sessions attached in process
//! and over a real WebSocket server.

use std::time::Duration;

use serde_json::{json, Value};
use tandem_sync::client::QueryEvent;
use tandem_sync::submit::Submission;
use tandem_sync::tandem_ot::TypeRegistry;
use tandem_sync::{
    Action, Backend, Connection, ConnectionConfig, ConnectionState, Doc, DocConfig, OpKind,
    ServerConfig, SyncError, SyncServer, Transport,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Polls `check` until it holds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn connected(backend: &Backend) -> Connection {
    let connection = backend.connect();
    connection.wait_connected().await.unwrap();
    connection
}

async fn create(connection: &Connection, id: &str, data: Value, type_name: &str) -> Doc {
    let doc = connection.get("dogs", id);
    doc.fetch().await.unwrap();
    doc.create(data, type_name).await.unwrap();
    doc
}

async fn subscribed(connection: &Connection, id: &str) -> Doc {
    let doc = connection.get("dogs", id);
    doc.subscribe().await.unwrap();
    doc
}

/// A session whose wire can be cut by aborting the returned task.
fn relayed(backend: &Backend) -> (Transport, JoinHandle<()>) {
    let (client, mut near) = Transport::pair();
    let (mut far, agent) = Transport::pair();
    backend.listen(agent);
    let relay = tokio::spawn(async move {
        loop {
            tokio::select! {
                message = near.recv() => match message {
                    Some(message) => {
                        if far.send(message).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                message = far.recv() => match message {
                    Some(message) => {
                        if near.send(message).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    (client, relay)
}

// ─── Basic sync ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_basic_sync() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;

    let doc_a = create(&alice, "fido", json!({}), "json0").await;
    let doc_b = bob.get("dogs", "fido");
    doc_b.fetch().await.unwrap();
    assert_eq!(doc_a.version(), Some(1));
    assert_eq!(doc_b.version(), Some(1));
    assert_eq!(doc_b.data(), json!({}));

    doc_b.subscribe().await.unwrap();
    doc_a
        .submit_op(json!([{"p": ["color"], "oi": "white"}]))
        .await
        .unwrap();

    eventually("bob to see the edit", || doc_b.version() == Some(2)).await;
    assert_eq!(doc_b.data(), json!({"color": "white"}));

    let stored = backend.fetch(None, "dogs", "fido").await.unwrap();
    assert_eq!((stored.v, stored.data), (2, json!({"color": "white"})));
    let earlier = backend.fetch_snapshot(None, "dogs", "fido", Some(1)).await.unwrap();
    assert_eq!(earlier.data, json!({}));
}

#[tokio::test]
async fn test_submit_snapshot_and_delete() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;

    let doc_a = create(&alice, "fido", json!({"color": "white"}), "json0").await;
    let doc_b = subscribed(&bob, "fido").await;

    doc_a
        .submit_snapshot(json!({"color": "white", "age": 3}))
        .await
        .unwrap();
    // Nothing to diff.
    doc_a.submit_snapshot(doc_a.data()).await.unwrap();
    eventually("bob to see the diff", || doc_b.data() == json!({"color": "white", "age": 3})).await;

    doc_a.del().await.unwrap();
    eventually("bob to see the delete", || !doc_b.exists()).await;
    assert_eq!(doc_b.version(), Some(3));
    assert!(matches!(doc_a.submit_op(json!([])).await, Err(SyncError::NotFound(_))));
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_edits_transform() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;

    let doc_a = create(&alice, "fido", json!({"color": "white"}), "json0").await;
    doc_a.subscribe().await.unwrap();
    // Bob only fetches, so he learns of Alice's edit from his own submit.
    let doc_b = bob.get("dogs", "fido");
    doc_b.fetch().await.unwrap();

    doc_a
        .submit_op(json!([{"p": ["color"], "oi": "gray", "od": "white"}]))
        .await
        .unwrap();
    assert_eq!(doc_b.version(), Some(1));
    doc_b.submit_op(json!([{"p": ["weight"], "oi": 40}])).await.unwrap();

    let expected = json!({"color": "gray", "weight": 40});
    assert_eq!(doc_b.data(), expected);
    assert_eq!(doc_b.version(), Some(3));
    eventually("alice to see bob's edit", || doc_a.version() == Some(3)).await;
    assert_eq!(doc_a.data(), expected);

    let ops = backend.get_ops(None, "dogs", "fido", 2, None).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OpKind::Edit(json!([{"p": ["weight"], "oi": 40}])));
}

#[tokio::test]
async fn test_sessions_converge() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;
    let carol = connected(&backend).await;

    let doc_a = create(&alice, "notes", json!("hello"), "text").await;
    doc_a.subscribe().await.unwrap();
    let doc_b = subscribed(&bob, "notes").await;
    let doc_c = subscribed(&carol, "notes").await;

    doc_a.pause();
    doc_b.pause();
    let mut acks = Vec::new();
    for (i, word) in ["one ", "two ", "three "].iter().enumerate() {
        acks.push(doc_a.submit_op(json!([i * 2, word])));
        acks.push(doc_b.submit_op(json!([5, " and"])));
    }
    doc_a.resume();
    doc_b.resume();
    for ack in acks {
        ack.await.unwrap();
    }

    let stored = backend.fetch(None, "dogs", "notes").await.unwrap();
    for doc in [&doc_a, &doc_b, &doc_c] {
        eventually("every session to catch up", || doc.version() == Some(stored.v)).await;
        assert_eq!(doc.data(), stored.data);
    }
}

// ─── Rollback ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_op_is_refused_locally() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let doc = create(&alice, "scooby", json!({"name": "Scooby"}), "json0").await;

    let result = doc.submit_op(json!([{"p": ["name", 0], "ld": "S"}])).await;
    assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    assert_eq!(doc.data(), json!({"name": "Scooby"}));

    doc.submit_op(json!([{"p": ["snacks"], "oi": true}])).await.unwrap();
    assert_eq!(doc.data(), json!({"name": "Scooby", "snacks": true}));

    // The authority refuses the same op from a session that skipped the
    // local check.
    let raw = Submission {
        src: "raw".into(),
        seq: 1,
        v: Some(2),
        kind: OpKind::Edit(json!([{"p": ["name", 0], "ld": "S"}])),
    };
    assert!(matches!(
        backend.submit(None, "dogs", "scooby", raw).await,
        Err(SyncError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn test_rejected_op_rolls_back() {
    let backend = Backend::in_memory();
    backend.use_middleware(Action::Submit, |request| {
        let black = request
            .op
            .as_ref()
            .and_then(|op| op.kind.edit())
            .is_some_and(|edit| edit.to_string().contains("black"));
        if black {
            return Err(SyncError::Rejected("no black dogs".into()));
        }
        Ok(())
    });
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;
    let doc_a = create(&alice, "fido", json!({"color": "white"}), "json0").await;
    doc_a.subscribe().await.unwrap();
    let doc_b = subscribed(&bob, "fido").await;

    let refused = doc_a.submit_op(json!([{"p": ["color"], "od": "white", "oi": "black"}]));
    let kept = doc_a.submit_op(json!([{"p": ["age"], "oi": 2}]));
    assert_eq!(doc_a.data(), json!({"color": "black", "age": 2}));

    // Rejection is silent; the batch was composed so both roll back.
    refused.await.unwrap();
    kept.await.unwrap();
    assert_eq!(doc_a.data(), json!({"color": "white"}));
    assert_eq!(doc_a.version(), Some(1));

    doc_a.submit_op(json!([{"p": ["age"], "oi": 2}])).await.unwrap();
    eventually("bob to see the accepted edit", || doc_b.version() == Some(2)).await;
    assert_eq!(doc_b.data(), json!({"color": "white", "age": 2}));
}

#[tokio::test]
async fn test_remote_create_wins() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;
    let doc_a = subscribed(&alice, "rex").await;
    let doc_b = bob.get("dogs", "rex");
    doc_b.fetch().await.unwrap();

    doc_a.create(json!({"owner": "alice"}), "json0").await.unwrap();
    let result = doc_b.create(json!({"owner": "bob"}), "json0").await;
    assert_eq!(result, Err(SyncError::CreatedRemotely));

    eventually("bob to adopt alice's document", || doc_b.data() == json!({"owner": "alice"})).await;
    assert_eq!(doc_b.version(), Some(1));
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_presence_follows_edits_and_expires() {
    let backend = Backend::in_memory();
    let config = ConnectionConfig {
        sweep_interval: Duration::from_millis(20),
        doc: DocConfig {
            received_presence_timeout: Duration::from_millis(300),
            ..DocConfig::default()
        },
    };
    let alice = backend.connect_with(config.clone());
    let bob = backend.connect_with(config);
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();

    let doc_a = subscribed(&alice, "notes").await;
    doc_a.create(json!(""), "text").await.unwrap();
    for word in ["a", "b", "c", "d"] {
        doc_a.submit_op(json!([word])).await.unwrap();
    }
    assert_eq!(doc_a.version(), Some(5));
    let doc_b = subscribed(&bob, "notes").await;

    doc_a.submit_presence(json!({"start": 1, "end": 2})).await.unwrap();
    let alice_id = alice.id().unwrap();
    eventually("bob to see alice's cursor", || doc_b.presence().contains_key(&alice_id)).await;
    assert_eq!(doc_b.presence()[&alice_id], json!({"start": 1, "end": 2}));

    // Bob types before the cursor; it moves right.
    doc_b.submit_op(json!(["xy"])).await.unwrap();
    assert_eq!(doc_b.presence()[&alice_id], json!({"start": 3, "end": 4}));

    eventually("alice's cursor to expire", || doc_b.presence().is_empty()).await;
}

#[tokio::test]
async fn test_presence_cleared_on_unsubscribe() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;
    let doc_a = create(&alice, "notes", json!("hello"), "text").await;
    doc_a.subscribe().await.unwrap();
    let doc_b = subscribed(&bob, "notes").await;

    doc_a.submit_presence(json!({"start": 0, "end": 5})).await.unwrap();
    let alice_id = alice.id().unwrap();
    eventually("bob to see alice", || doc_b.presence().contains_key(&alice_id)).await;

    doc_a.unsubscribe().await.unwrap();
    eventually("alice's cursor to go", || doc_b.presence().is_empty()).await;

    // Presence needs a subscription, and json0 has none at all.
    assert!(matches!(
        doc_a.submit_presence(json!({"start": 0, "end": 0})).await,
        Err(SyncError::NotSubscribed(_))
    ));
    let doc_json = create(&alice, "fido", json!({}), "json0").await;
    doc_json.subscribe().await.unwrap();
    assert!(matches!(
        doc_json.submit_presence(json!({})).await,
        Err(SyncError::PresenceUnsupported(_))
    ));
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queries() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let bob = connected(&backend).await;
    create(&alice, "fido", json!({"color": "white"}), "json0").await;
    create(&alice, "spot", json!({"color": "black"}), "json0").await;

    let docs = bob.fetch_query("dogs", json!({"color": "white"})).await.unwrap();
    let ids: Vec<&str> = docs.iter().map(|doc| doc.id()).collect();
    assert_eq!(ids, ["fido"]);
    assert_eq!(docs[0].data(), json!({"color": "white"}));

    let query = bob.subscribe_query("dogs", json!({"color": "white"})).await.unwrap();
    let mut events = query.events();
    create(&alice, "rex", json!({"color": "white"}), "json0").await;

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, QueryEvent::Changed);
    assert_eq!(query.ids(), ["fido", "rex"]);
    query.destroy();
}

// ─── Connection lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_edits_sync_after_reconnect() {
    let backend = Backend::in_memory();
    let (transport, relay) = relayed(&backend);
    let alice = Connection::new(transport, TypeRegistry::with_defaults(), ConnectionConfig::default());
    alice.wait_connected().await.unwrap();
    let bob = connected(&backend).await;

    let doc_a = create(&alice, "fido", json!({}), "json0").await;
    doc_a.subscribe().await.unwrap();
    let doc_b = subscribed(&bob, "fido").await;

    relay.abort();
    eventually("alice to notice", || alice.state() == ConnectionState::Disconnected).await;
    let offline = doc_a.submit_op(json!([{"p": ["color"], "oi": "white"}]));
    doc_b.submit_op(json!([{"p": ["age"], "oi": 3}])).await.unwrap();
    assert_eq!(doc_a.data(), json!({"color": "white"}));
    assert!(doc_a.has_write_pending());

    let (transport, _relay) = relayed(&backend);
    alice.bind(transport);
    alice.wait_connected().await.unwrap();
    offline.await.unwrap();

    let expected = json!({"color": "white", "age": 3});
    assert_eq!(doc_a.data(), expected);
    assert_eq!(doc_a.version(), Some(3));
    assert!(doc_a.subscribed());
    eventually("bob to see alice's offline edit", || doc_b.version() == Some(3)).await;
    assert_eq!(doc_b.data(), expected);
}

#[tokio::test]
async fn test_close_fails_queued_work() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let doc = create(&alice, "fido", json!({}), "json0").await;

    doc.pause();
    let queued = doc.submit_op(json!([{"p": ["color"], "oi": "white"}]));
    alice.close();
    assert_eq!(queued.await, Err(SyncError::Closed));
    assert_eq!(alice.wait_connected().await, Err(SyncError::Closed));
}

#[tokio::test]
async fn test_destroy_forgets_document() {
    let backend = Backend::in_memory();
    let alice = connected(&backend).await;
    let doc = create(&alice, "fido", json!({"color": "white"}), "json0").await;
    doc.subscribe().await.unwrap();
    doc.destroy().await.unwrap();

    let fresh = alice.get("dogs", "fido");
    assert_eq!(fresh.version(), None);
    assert!(!fresh.subscribed());
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

async fn start_test_server() -> (String, Backend) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig::default(), Backend::in_memory());
    let backend = server.backend().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), backend)
}

#[tokio::test]
async fn test_websocket_sync() {
    let (url, backend) = start_test_server().await;
    let alice = Connection::connect_ws(&url, TypeRegistry::with_defaults(), ConnectionConfig::default())
        .await
        .unwrap();
    let bob = Connection::connect_ws(&url, TypeRegistry::with_defaults(), ConnectionConfig::default())
        .await
        .unwrap();
    alice.wait_connected().await.unwrap();
    bob.wait_connected().await.unwrap();
    assert_ne!(alice.id(), bob.id());

    let doc_a = create(&alice, "fido", json!({}), "json0").await;
    let doc_b = subscribed(&bob, "fido").await;
    assert_eq!(doc_b.version(), Some(1));

    doc_a
        .submit_op(json!([{"p": ["color"], "oi": "white"}]))
        .await
        .unwrap();
    eventually("bob to see the edit over the socket", || doc_b.version() == Some(2)).await;
    assert_eq!(doc_b.data(), json!({"color": "white"}));
    assert_eq!(backend.fetch(None, "dogs", "fido").await.unwrap().v, 2);

    alice.close();
    eventually("the authority to drop alice's session", || backend.agents_count() == 1).await;
}

#[tokio::test]
async fn test_websocket_survives_garbage() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as Frame;

    let (url, _backend) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let Some(Ok(Frame::Text(handshake))) = ws.next().await else {
        panic!("expected handshake");
    };
    let handshake: Value = serde_json::from_str(handshake.as_str()).unwrap();
    assert_eq!(handshake["a"], "hs");

    ws.send(Frame::Text(r#"{"a":"f","c":"dogs"}"#.into())).await.unwrap();
    ws.send(Frame::Text(r#"{"a":"pp"}"#.into())).await.unwrap();
    let Some(Ok(Frame::Text(reply))) = ws.next().await else {
        panic!("expected ping reply");
    };
    assert_eq!(reply.as_str(), r#"{"a":"pp"}"#);
}

//! Server side of one session.
//!
//! An agent reads requests from its transport one at a time and answers
//! them in order. Broadcasts for subscribed documents and live query
//! updates are produced by helper tasks but funneled back through the
//! agent loop, so anything the agent sends while handling a request (missed
//! ops, then the acknowledgement) goes out before any later broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Backend, SubscribeStart};
use crate::error::SyncError;
use crate::middleware::{Action, Request};
use crate::op::{Op, Snapshot};
use crate::protocol::{
    DocRequest, Handshake, Message, OpMessage, PresenceMessage, QueryMessage, PROTOCOL_VERSION,
};
use crate::pubsub::Subscription;
use crate::submit::Submission;
use crate::transport::Transport;

type DocKey = (String, String);

/// Produced by helper tasks for the agent loop.
enum Streamed {
    Doc {
        key: DocKey,
        generation: u64,
        message: Arc<Message>,
    },
    Query {
        id: u64,
        message: Message,
    },
}

struct DocSubscription {
    generation: u64,
    task: JoinHandle<()>,
}

pub(crate) struct Agent {
    backend: Backend,
    transport: Transport,
    id: String,
    subscriptions: HashMap<DocKey, DocSubscription>,
    queries: HashMap<u64, JoinHandle<()>>,
    /// Last presence seq this session published per document.
    presence_seq: HashMap<DocKey, u64>,
    next_generation: u64,
    stream_tx: mpsc::UnboundedSender<Streamed>,
    stream_rx: mpsc::UnboundedReceiver<Streamed>,
}

impl Agent {
    pub(crate) fn new(backend: Backend, transport: Transport) -> Self {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            transport,
            id: uuid::Uuid::new_v4().to_string(),
            subscriptions: HashMap::new(),
            queries: HashMap::new(),
            presence_seq: HashMap::new(),
            next_generation: 0,
            stream_tx,
            stream_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        self.backend.agent_started();

        let mut request = Request::new(Action::Connect, "").agent(Some(&self.id));
        if let Err(e) = self.backend.middleware().trigger(&mut request) {
            log::warn!("Refused session {}: {e}", self.id);
            self.send(Message::Handshake(Handshake {
                id: None,
                protocol: PROTOCOL_VERSION,
                types: Vec::new(),
                error: Some(e.to_payload()),
            }));
            self.backend.agent_stopped();
            return;
        }

        log::info!("Session {} connected", self.id);
        self.send(Message::Handshake(Handshake {
            id: Some(self.id.clone()),
            protocol: PROTOCOL_VERSION,
            types: self.backend.types().uris().into_iter().map(str::to_string).collect(),
            error: None,
        }));

        loop {
            tokio::select! {
                incoming = self.transport.recv() => match incoming {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some(streamed) = self.stream_rx.recv() => self.forward(streamed),
            }
        }

        self.close();
    }

    fn send(&self, message: Message) {
        if self.transport.send(message).is_err() {
            log::trace!("Session {} dropped an outgoing message", self.id);
        }
    }

    async fn handle(&mut self, message: Message) {
        log::trace!("Session {} received {}", self.id, message.action());

        let mut request = Request::new(Action::Receive, message.doc_key().map_or("", |(c, _)| c))
            .agent(Some(&self.id));
        request.message = Some(message.clone());
        if let Err(e) = self.backend.middleware().trigger(&mut request) {
            if let Some(reply) = error_reply(&message, &e, &self.id) {
                self.send(reply);
            }
            return;
        }
        let message = request.message.unwrap_or(message);

        let result = match &message {
            Message::Fetch(req) => self.fetch(req).await,
            Message::Subscribe(req) => self.subscribe(req).await,
            Message::Unsubscribe(req) => {
                self.unsubscribe(req);
                Ok(())
            }
            Message::Op(msg) => self.submit(msg).await,
            Message::Presence(msg) => self.presence(msg),
            Message::QueryFetch(msg) => self.query_fetch(msg).await,
            Message::QuerySubscribe(msg) => self.query_subscribe(msg).await,
            Message::QueryUnsubscribe(msg) => {
                self.query_unsubscribe(msg);
                Ok(())
            }
            Message::Ping => {
                self.send(Message::Ping);
                Ok(())
            }
            Message::Handshake(_) | Message::QueryUpdate(_) => Err(SyncError::InvalidMessage(format!(
                "Unexpected {} from client",
                message.action()
            ))),
        };

        if let Err(e) = result {
            log::debug!("Session {} {} failed: {e}", self.id, message.action());
            if let Some(reply) = error_reply(&message, &e, &self.id) {
                self.send(reply);
            }
        }
    }

    // ─── Documents ────────────────────────────────────────────────────

    async fn fetch(&mut self, req: &DocRequest) -> Result<(), SyncError> {
        match req.v {
            None => {
                let snapshot = self.backend.fetch(Some(&self.id), &req.c, &req.d).await?;
                self.send(Message::Fetch(req.reply(Some(snapshot))));
            }
            Some(v) => {
                let ops = self.backend.get_ops(Some(&self.id), &req.c, &req.d, v, None).await?;
                self.send_ops(&req.c, &req.d, ops);
                self.send(Message::Fetch(req.reply(None)));
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self, req: &DocRequest) -> Result<(), SyncError> {
        let key = (req.c.clone(), req.d.clone());
        if let Some(previous) = self.subscriptions.remove(&key) {
            previous.task.abort();
        }

        let (subscription, start) = self
            .backend
            .subscribe(Some(&self.id), &req.c, &req.d, req.v)
            .await?;
        match start {
            SubscribeStart::Snapshot(snapshot) => {
                self.send(Message::Subscribe(req.reply(Some(snapshot))));
            }
            SubscribeStart::Ops(ops) => {
                self.send_ops(&req.c, &req.d, ops);
                self.send(Message::Subscribe(req.reply(None)));
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let task = tokio::spawn(pump_doc(
            subscription,
            key.clone(),
            generation,
            self.stream_tx.clone(),
        ));
        self.subscriptions.insert(key, DocSubscription { generation, task });
        Ok(())
    }

    fn unsubscribe(&mut self, req: &DocRequest) {
        let key = (req.c.clone(), req.d.clone());
        if let Some(subscription) = self.subscriptions.remove(&key) {
            subscription.task.abort();
        }
        self.clear_presence(&key);
        self.send(Message::Unsubscribe(req.reply(None)));
    }

    async fn submit(&mut self, msg: &OpMessage) -> Result<(), SyncError> {
        let src = msg.src.clone().unwrap_or_else(|| self.id.clone());
        let seq = msg
            .seq
            .ok_or_else(|| SyncError::InvalidMessage("Op is missing seq".into()))?;
        let submission = Submission {
            src: src.clone(),
            seq,
            v: msg.v,
            kind: msg.kind.clone(),
        };

        match self.backend.submit(Some(&self.id), &msg.c, &msg.d, submission).await {
            Ok(outcome) => {
                let ops = outcome
                    .ops
                    .into_iter()
                    .filter_map(|op| self.sanitize(&msg.c, &msg.d, op))
                    .collect();
                self.send_ops(&msg.c, &msg.d, ops);
                self.send(Message::Op(OpMessage::ack(&msg.c, &msg.d, &src, seq, outcome.op.v)));
            }
            Err(e) => {
                log::debug!("Rejected {src}/{seq} on {}.{}: {e}", msg.c, msg.d);
                self.send(Message::Op(OpMessage::rejection(&msg.c, &msg.d, &src, seq, &e)));
            }
        }
        Ok(())
    }

    /// Sends ops that were already sanitized for this session.
    fn send_ops(&self, c: &str, d: &str, ops: Vec<Op>) {
        for op in ops {
            self.send(Message::Op(OpMessage::from_op(c, d, &op)));
        }
    }

    fn sanitize(&self, c: &str, d: &str, op: Op) -> Option<Op> {
        match self.backend.sanitize_op(Some(&self.id), c, d, op) {
            Ok(op) => Some(op),
            Err(e) => {
                log::debug!("Withheld op on {c}.{d} from session {}: {e}", self.id);
                None
            }
        }
    }

    // ─── Presence ─────────────────────────────────────────────────────

    fn presence(&mut self, msg: &PresenceMessage) -> Result<(), SyncError> {
        let key = (msg.c.clone(), msg.d.clone());
        if !self.subscriptions.contains_key(&key) {
            return Err(SyncError::NotSubscribed(format!("{}.{}", msg.c, msg.d)));
        }
        self.presence_seq.insert(key, msg.seq);

        self.backend.publish_presence(PresenceMessage {
            src: Some(self.id.clone()),
            error: None,
            ..msg.clone()
        });
        self.send(Message::Presence(PresenceMessage {
            src: None,
            r: false,
            error: None,
            ..msg.clone()
        }));
        Ok(())
    }

    /// Tells peers this session's cursor is gone.
    fn clear_presence(&mut self, key: &DocKey) {
        let Some(seq) = self.presence_seq.remove(key) else {
            return;
        };
        self.backend.publish_presence(PresenceMessage {
            c: key.0.clone(),
            d: key.1.clone(),
            src: Some(self.id.clone()),
            seq: seq + 1,
            v: None,
            p: Value::Null,
            r: false,
            error: None,
        });
    }

    // ─── Queries ──────────────────────────────────────────────────────

    async fn query_fetch(&mut self, msg: &QueryMessage) -> Result<(), SyncError> {
        let results = self.backend.query_fetch(Some(&self.id), &msg.c, &msg.q).await?;
        self.send(Message::QueryFetch(msg.reply(results)));
        Ok(())
    }

    async fn query_subscribe(&mut self, msg: &QueryMessage) -> Result<(), SyncError> {
        if let Some(previous) = self.queries.remove(&msg.id) {
            previous.abort();
        }
        let (subscription, results) = self
            .backend
            .query_subscribe(Some(&self.id), &msg.c, &msg.q)
            .await?;
        let live = LiveQuery {
            backend: self.backend.clone(),
            agent: self.id.clone(),
            id: msg.id,
            collection: msg.c.clone(),
            query: msg.q.clone(),
            versions: versions(&results),
            stream_tx: self.stream_tx.clone(),
        };
        self.send(Message::QuerySubscribe(msg.reply(results)));
        self.queries.insert(msg.id, tokio::spawn(live.run(subscription)));
        Ok(())
    }

    fn query_unsubscribe(&mut self, msg: &QueryMessage) {
        if let Some(task) = self.queries.remove(&msg.id) {
            task.abort();
        }
        self.send(Message::QueryUnsubscribe(QueryMessage {
            id: msg.id,
            c: msg.c.clone(),
            q: Value::Null,
            results: None,
            error: None,
        }));
    }

    // ─── Broadcasts ───────────────────────────────────────────────────

    fn forward(&self, streamed: Streamed) {
        match streamed {
            Streamed::Doc {
                key,
                generation,
                message,
            } => {
                // Drop what was queued by a subscription that has since ended.
                if self.subscriptions.get(&key).map(|s| s.generation) != Some(generation) {
                    return;
                }
                match message.as_ref() {
                    Message::Op(msg) => {
                        // Own ops are answered with an acknowledgement instead.
                        if msg.src.as_deref() == Some(self.id.as_str()) {
                            return;
                        }
                        let Some(op) = msg.to_op() else {
                            return;
                        };
                        if let Some(op) = self.sanitize(&key.0, &key.1, op) {
                            self.send(Message::Op(OpMessage::from_op(&key.0, &key.1, &op)));
                        }
                    }
                    Message::Presence(msg) => {
                        // A projection and its target share a channel but
                        // not their presence.
                        if msg.src.as_deref() != Some(self.id.as_str()) && msg.c == key.0 {
                            self.send(Message::Presence(msg.clone()));
                        }
                    }
                    other => self.send(other.clone()),
                }
            }
            Streamed::Query { id, message } => {
                if self.queries.contains_key(&id) {
                    self.send(message);
                }
            }
        }
    }

    fn close(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.task.abort();
        }
        for (_, task) in self.queries.drain() {
            task.abort();
        }
        let keys: Vec<DocKey> = self.presence_seq.keys().cloned().collect();
        for key in keys {
            self.clear_presence(&key);
        }
        self.backend.agent_stopped();
        log::info!("Session {} disconnected", self.id);
    }
}

async fn pump_doc(
    mut subscription: Subscription,
    key: DocKey,
    generation: u64,
    tx: mpsc::UnboundedSender<Streamed>,
) {
    while let Some(message) = subscription.recv().await {
        let streamed = Streamed::Doc {
            key: key.clone(),
            generation,
            message,
        };
        if tx.send(streamed).is_err() {
            break;
        }
    }
}

/// Re-runs a query whenever its collection sees a commit, and pushes the
/// new results when ids or versions changed.
struct LiveQuery {
    backend: Backend,
    agent: String,
    id: u64,
    collection: String,
    query: Value,
    versions: Vec<(String, u64)>,
    stream_tx: mpsc::UnboundedSender<Streamed>,
}

impl LiveQuery {
    async fn run(mut self, mut subscription: Subscription) {
        while let Some(message) = subscription.recv().await {
            if !matches!(message.as_ref(), Message::Op(_)) {
                continue;
            }
            tokio::time::sleep(self.backend.config().query_debounce).await;
            // Anything that arrived during the quiet period is covered by
            // the re-run below.
            while let Some(Some(_)) = subscription.recv().now_or_never() {}

            let results = match self
                .backend
                .query_fetch(Some(&self.agent), &self.collection, &self.query)
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    log::warn!("Live query {} on {} failed: {e}", self.id, self.collection);
                    continue;
                }
            };
            let current = versions(&results);
            if current == self.versions {
                continue;
            }
            self.versions = current;
            let message = Message::QueryUpdate(QueryMessage {
                id: self.id,
                c: self.collection.clone(),
                q: Value::Null,
                results: Some(results),
                error: None,
            });
            if self.stream_tx.send(Streamed::Query { id: self.id, message }).is_err() {
                break;
            }
        }
    }
}

fn versions(results: &[Snapshot]) -> Vec<(String, u64)> {
    results.iter().map(|s| (s.id.clone(), s.v)).collect()
}

/// The reply that carries `err` back for `message`, if it expects one.
fn error_reply(message: &Message, err: &SyncError, agent: &str) -> Option<Message> {
    Some(match message {
        Message::Fetch(req) => Message::Fetch(req.reply_error(err)),
        Message::Subscribe(req) => Message::Subscribe(req.reply_error(err)),
        Message::Unsubscribe(req) => Message::Unsubscribe(req.reply_error(err)),
        Message::Op(msg) => Message::Op(OpMessage::rejection(
            &msg.c,
            &msg.d,
            msg.src.as_deref().unwrap_or(agent),
            msg.seq.unwrap_or_default(),
            err,
        )),
        Message::Presence(msg) => Message::Presence(PresenceMessage {
            src: None,
            error: Some(err.to_payload()),
            ..msg.clone()
        }),
        Message::QueryFetch(msg) => Message::QueryFetch(msg.reply_error(err)),
        Message::QuerySubscribe(msg) => Message::QuerySubscribe(msg.reply_error(err)),
        Message::QueryUnsubscribe(msg) => Message::QueryUnsubscribe(msg.reply_error(err)),
        Message::Handshake(_) | Message::QueryUpdate(_) | Message::Ping => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{CreateOp, OpKind};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(transport: &mut Transport) -> Message {
        timeout(Duration::from_secs(2), transport.recv())
            .await
            .expect("timed out")
            .expect("transport closed")
    }

    async fn start(backend: &Backend) -> (Transport, String) {
        let (mut client, server) = Transport::pair();
        backend.listen(server);
        let Message::Handshake(hs) = next(&mut client).await else {
            panic!("expected handshake");
        };
        (client, hs.id.unwrap())
    }

    fn create_msg(seq: u64) -> Message {
        Message::Op(OpMessage {
            c: "dogs".into(),
            d: "fido".into(),
            v: Some(0),
            src: None,
            seq: Some(seq),
            kind: OpKind::Create(CreateOp {
                type_uri: "json0".into(),
                data: Some(json!({})),
            }),
            error: None,
        })
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let backend = Backend::in_memory();
        let (mut client, id) = start(&backend).await;
        assert!(!id.is_empty());
        assert_eq!(backend.agents_count(), 1);

        client.send(Message::Ping).unwrap();
        assert_eq!(next(&mut client).await, Message::Ping);
    }

    #[tokio::test]
    async fn test_connect_middleware_refuses() {
        let backend = Backend::in_memory();
        backend.use_middleware(Action::Connect, |_| Err(SyncError::Rejected("full".into())));
        let (mut client, server) = Transport::pair();
        backend.listen(server);
        let Message::Handshake(hs) = next(&mut client).await else {
            panic!("expected handshake");
        };
        assert_eq!(hs.id, None);
        assert_eq!(hs.error.unwrap().code, 4002);
    }

    #[tokio::test]
    async fn test_submit_is_acknowledged_with_version() {
        let backend = Backend::in_memory();
        let (mut client, id) = start(&backend).await;

        client.send(create_msg(1)).unwrap();
        let Message::Op(ack) = next(&mut client).await else {
            panic!("expected ack");
        };
        assert_eq!(ack.src.as_deref(), Some(id.as_str()));
        assert_eq!((ack.seq, ack.v), (Some(1), Some(0)));
        assert_eq!(ack.kind, OpKind::Noop);
        assert!(ack.error.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_receives_others_ops_only() {
        let backend = Backend::in_memory();
        let (mut alice, _) = start(&backend).await;
        let (mut bob, _) = start(&backend).await;

        bob.send(Message::Subscribe(DocRequest::new("dogs", "fido", None))).unwrap();
        let Message::Subscribe(reply) = next(&mut bob).await else {
            panic!("expected subscribe reply");
        };
        assert_eq!(reply.data.unwrap().v, 0);

        alice.send(Message::Subscribe(DocRequest::new("dogs", "fido", None))).unwrap();
        next(&mut alice).await;
        alice.send(create_msg(1)).unwrap();

        let Message::Op(op) = next(&mut bob).await else {
            panic!("expected op");
        };
        assert!(matches!(op.kind, OpKind::Create(_)));

        // Alice only sees her ack.
        let Message::Op(ack) = next(&mut alice).await else {
            panic!("expected ack");
        };
        assert_eq!(ack.kind, OpKind::Noop);
        assert!(timeout(Duration::from_millis(50), alice.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_projection_subscriber_sees_projected_ops() {
        let backend = Backend::in_memory();
        backend.add_projection("dog_names", "dogs", ["name"]).unwrap();
        let (mut writer, _) = start(&backend).await;
        let (mut reader, _) = start(&backend).await;

        reader
            .send(Message::Subscribe(DocRequest::new("dog_names", "fido", None)))
            .unwrap();
        next(&mut reader).await;

        writer
            .send(Message::Op(OpMessage {
                c: "dogs".into(),
                d: "fido".into(),
                v: Some(0),
                src: None,
                seq: Some(1),
                kind: OpKind::Create(CreateOp {
                    type_uri: "json0".into(),
                    data: Some(json!({ "name": "Fido", "owner": "Ann" })),
                }),
                error: None,
            }))
            .unwrap();
        next(&mut writer).await;

        let Message::Op(op) = next(&mut reader).await else {
            panic!("expected op");
        };
        assert_eq!(op.c, "dog_names");
        let OpKind::Create(created) = op.kind else {
            panic!("expected create");
        };
        assert_eq!(created.data, Some(json!({ "name": "Fido" })));
    }

    #[tokio::test]
    async fn test_presence_requires_subscription() {
        let backend = Backend::in_memory();
        let (mut client, _) = start(&backend).await;
        client
            .send(Message::Presence(PresenceMessage {
                c: "dogs".into(),
                d: "fido".into(),
                src: None,
                seq: 1,
                v: Some(0),
                p: json!({ "start": 0, "end": 0 }),
                r: false,
                error: None,
            }))
            .unwrap();
        let Message::Presence(reply) = next(&mut client).await else {
            panic!("expected presence reply");
        };
        assert_eq!(reply.error.unwrap().code, 4026);
    }

    #[tokio::test]
    async fn test_disconnect_clears_presence() {
        let backend = Backend::in_memory();
        let (mut alice, _) = start(&backend).await;
        let (mut bob, bob_id) = start(&backend).await;
        for client in [&mut alice, &mut bob] {
            client.send(Message::Subscribe(DocRequest::new("dogs", "fido", None))).unwrap();
            next(client).await;
        }

        bob.send(Message::Presence(PresenceMessage {
            c: "dogs".into(),
            d: "fido".into(),
            src: None,
            seq: 3,
            v: Some(0),
            p: json!({ "start": 1, "end": 1 }),
            r: false,
            error: None,
        }))
        .unwrap();
        let Message::Presence(seen) = next(&mut alice).await else {
            panic!("expected presence");
        };
        assert_eq!(seen.src.as_deref(), Some(bob_id.as_str()));

        drop(bob);
        let Message::Presence(gone) = next(&mut alice).await else {
            panic!("expected presence");
        };
        assert_eq!(gone.src.as_deref(), Some(bob_id.as_str()));
        assert!(gone.p.is_null());
        assert_eq!(gone.v, None);
        assert_eq!(gone.seq, 4);
    }

    #[tokio::test]
    async fn test_live_query_pushes_new_results() {
        let backend = Backend::in_memory();
        let (mut watcher, _) = start(&backend).await;
        let (writer, _) = start(&backend).await;

        watcher
            .send(Message::QuerySubscribe(QueryMessage {
                id: 1,
                c: "dogs".into(),
                q: json!({}),
                results: None,
                error: None,
            }))
            .unwrap();
        let Message::QuerySubscribe(reply) = next(&mut watcher).await else {
            panic!("expected query reply");
        };
        assert_eq!(reply.results.unwrap().len(), 0);

        writer.send(create_msg(1)).unwrap();
        let Message::QueryUpdate(update) = next(&mut watcher).await else {
            panic!("expected query update");
        };
        assert_eq!(update.id, 1);
        assert_eq!(update.results.unwrap()[0].id, "fido");
    }
}

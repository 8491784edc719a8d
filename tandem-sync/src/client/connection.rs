//! Client session: one transport, many document handles.
//!
//! ```text
//!                     ┌──────────── driver task ────────────┐
//! transport.rx ──────►│ handshake / replies / ops / presence │──► DocState (per doc)
//! commands ──────────►│ flush, bind, close                   │──► QueryState (per query)
//! sweep interval ────►│ presence GC                          │
//!                     └──────────────────────────────────────┘
//! Doc handles ──► Link ──► transport.tx
//! ```
//!
//! The driver holds only a weak reference to the session, so dropping the
//! last [`Connection`] clone ends it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tandem_ot::TypeRegistry;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::SyncError;
use crate::op::Snapshot;
use crate::protocol::{Handshake, Message, QueryMessage, PROTOCOL_VERSION};
use crate::transport::Transport;

use super::doc::{Doc, DocConfig, DocKey, DocState};
use super::query::{Query, QueryEvent, QueryState};
use super::socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the handshake.
    Connecting,
    Connected,
    /// The transport went away; [`Connection::bind`] resumes.
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often expired presence and cached ops are dropped.
    pub sweep_interval: Duration,
    pub doc: DocConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            doc: DocConfig::default(),
        }
    }
}

pub(crate) enum Command {
    Flush(DocKey),
    Bind(Transport),
    Close,
}

/// What document handles need from their connection.
pub(crate) struct Link {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    id: Mutex<Option<String>>,
    state: watch::Sender<ConnectionState>,
    seq: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Link {
    pub(crate) fn can_send(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub(crate) fn send(&self, message: Message) {
        let outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            log::trace!("Dropped {} while disconnected", message.action());
            return;
        };
        if tx.send(message).is_err() {
            log::trace!("Dropped a message on a closed transport");
        }
    }

    pub(crate) fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn schedule_flush(&self, key: DocKey) {
        let _ = self.commands.send(Command::Flush(key));
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

enum PendingQuery {
    Fetch {
        collection: String,
        query: Value,
        reply: oneshot::Sender<Result<Vec<Snapshot>, SyncError>>,
    },
    Live {
        state: Arc<QueryState>,
        ready: Option<oneshot::Sender<Result<(), SyncError>>>,
    },
}

pub(crate) struct Shared {
    link: Arc<Link>,
    types: TypeRegistry,
    config: ConnectionConfig,
    docs: Mutex<HashMap<DocKey, Arc<Mutex<DocState>>>>,
    queries: Mutex<HashMap<u64, PendingQuery>>,
    next_query_id: AtomicU64,
}

impl Shared {
    fn doc(self: &Arc<Self>, collection: &str, id: &str) -> Doc {
        let key = (collection.to_string(), id.to_string());
        let state = self
            .docs
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(DocState::new(
                    collection,
                    id,
                    Arc::clone(&self.link),
                    self.types.clone(),
                    self.config.doc.clone(),
                )))
            })
            .clone();
        Doc::new(state, Arc::downgrade(self), key)
    }

    fn doc_state(&self, collection: &str, id: &str) -> Option<Arc<Mutex<DocState>>> {
        self.docs
            .lock()
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    fn all_docs(&self) -> Vec<Arc<Mutex<DocState>>> {
        self.docs.lock().values().cloned().collect()
    }

    pub(crate) fn forget_doc(&self, key: &DocKey) {
        self.docs.lock().remove(key);
    }

    pub(crate) fn forget_query(&self, id: u64) {
        self.queries.lock().remove(&id);
    }

    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    /// Feeds query results into the handles, opening them as needed.
    fn ingest_results(self: &Arc<Self>, collection: &str, snapshots: Vec<Snapshot>) -> Vec<Doc> {
        snapshots
            .into_iter()
            .map(|snapshot| {
                let doc = self.doc(collection, &snapshot.id);
                if let Some(state) = self.doc_state(collection, &snapshot.id) {
                    state.lock().ingest_snapshot(Some(snapshot), Vec::new());
                }
                doc
            })
            .collect()
    }

    /// Registers a query and sends it if the session is up; otherwise the
    /// handshake sends it.
    fn register_query(&self, id: u64, pending: PendingQuery) {
        let mut queries = self.queries.lock();
        let pending = queries.entry(id).or_insert(pending);
        self.send_query(id, pending);
    }

    fn send_query(&self, id: u64, pending: &PendingQuery) {
        if !self.link.can_send() {
            return;
        }
        let message = match pending {
            PendingQuery::Fetch { collection, query, .. } => Message::QueryFetch(QueryMessage {
                id,
                c: collection.clone(),
                q: query.clone(),
                results: None,
                error: None,
            }),
            PendingQuery::Live { state, .. } => Message::QuerySubscribe(QueryMessage {
                id,
                c: state.collection.clone(),
                q: state.query.clone(),
                results: None,
                error: None,
            }),
        };
        self.link.send(message);
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    fn handle_message(self: &Arc<Self>, message: Message) {
        log::trace!("Connection received {}", message.action());
        match message {
            Message::Handshake(hs) => self.handle_handshake(hs),
            Message::Fetch(reply) => {
                if let Some(doc) = self.doc_state(&reply.c, &reply.d) {
                    doc.lock().handle_fetch(reply);
                }
            }
            Message::Subscribe(reply) => {
                if let Some(doc) = self.doc_state(&reply.c, &reply.d) {
                    doc.lock().handle_subscribe(reply);
                }
            }
            Message::Unsubscribe(reply) => {
                if let Some(doc) = self.doc_state(&reply.c, &reply.d) {
                    doc.lock().handle_unsubscribe(reply);
                }
            }
            Message::Op(msg) => {
                if let Some(doc) = self.doc_state(&msg.c, &msg.d) {
                    doc.lock().handle_op(msg);
                }
            }
            Message::Presence(msg) => {
                if let Some(doc) = self.doc_state(&msg.c, &msg.d) {
                    doc.lock().handle_presence(msg);
                }
            }
            Message::QueryFetch(msg) => self.handle_query_fetch(msg),
            Message::QuerySubscribe(msg) | Message::QueryUpdate(msg) => self.handle_query_results(msg),
            Message::QueryUnsubscribe(_) | Message::Ping => {}
        }
    }

    fn handle_handshake(&self, hs: Handshake) {
        if let Some(err) = hs.error {
            let err = SyncError::from_payload(&err);
            log::error!("Connection refused: {err}");
            self.close(err);
            return;
        }
        if hs.protocol != PROTOCOL_VERSION {
            log::warn!(
                "Authority speaks protocol {}, this client {PROTOCOL_VERSION}",
                hs.protocol
            );
        }
        log::info!("Connected as {}", hs.id.as_deref().unwrap_or("?"));
        *self.link.id.lock() = hs.id;
        self.link.set_state(ConnectionState::Connected);

        for doc in self.all_docs() {
            doc.lock().on_connected();
        }
        let queries = self.queries.lock();
        for (id, pending) in queries.iter() {
            self.send_query(*id, pending);
        }
    }

    fn handle_query_fetch(&self, msg: QueryMessage) {
        let Some(PendingQuery::Fetch { reply, .. }) = self.queries.lock().remove(&msg.id) else {
            return;
        };
        let result = match msg.error {
            Some(err) => Err(SyncError::from_payload(&err)),
            None => Ok(msg.results.unwrap_or_default()),
        };
        let _ = reply.send(result);
    }

    fn handle_query_results(self: &Arc<Self>, msg: QueryMessage) {
        let (state, ready) = {
            let mut queries = self.queries.lock();
            match queries.get_mut(&msg.id) {
                Some(PendingQuery::Live { state, ready }) => (Arc::clone(state), ready.take()),
                _ => return,
            }
        };
        if let Some(err) = msg.error {
            let err = SyncError::from_payload(&err);
            match ready {
                Some(ready) => {
                    self.forget_query(msg.id);
                    let _ = ready.send(Err(err));
                }
                None => state.emit(QueryEvent::Error(err)),
            }
            return;
        }
        let docs = self.ingest_results(&state.collection, msg.results.unwrap_or_default());
        state.set_results(docs);
        match ready {
            Some(ready) => {
                let _ = ready.send(Ok(()));
            }
            None => state.emit(QueryEvent::Changed),
        }
    }

    // ─── Transport lifecycle ──────────────────────────────────────────

    fn on_transport_closed(&self) {
        *self.link.outgoing.lock() = None;
        *self.link.id.lock() = None;
        if *self.link.state.borrow() != ConnectionState::Closed {
            log::info!("Connection lost");
            self.link.set_state(ConnectionState::Disconnected);
        }
        for doc in self.all_docs() {
            doc.lock().on_disconnected();
        }
    }

    fn bind(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.link.outgoing.lock() = Some(tx);
        self.link.set_state(ConnectionState::Connecting);
    }

    fn close(&self, err: SyncError) {
        *self.link.outgoing.lock() = None;
        *self.link.id.lock() = None;
        self.link.set_state(ConnectionState::Closed);
        for doc in self.all_docs() {
            doc.lock().on_closed();
        }
        let queries: Vec<PendingQuery> = self.queries.lock().drain().map(|(_, q)| q).collect();
        for query in queries {
            match query {
                PendingQuery::Fetch { reply, .. } => {
                    let _ = reply.send(Err(err.clone()));
                }
                PendingQuery::Live { state, ready } => match ready {
                    Some(ready) => {
                        let _ = ready.send(Err(err.clone()));
                    }
                    None => state.emit(QueryEvent::Error(err.clone())),
                },
            }
        }
    }

    fn sweep(&self, now: Instant) {
        for doc in self.all_docs() {
            doc.lock().sweep(now);
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::UnboundedReceiver<Message>>) -> Option<Message> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive(
    shared: Weak<Shared>,
    rx: mpsc::UnboundedReceiver<Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    sweep_interval: Duration,
) {
    let mut rx = Some(rx);
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = recv_or_pending(&mut rx) => {
                let Some(shared) = shared.upgrade() else { break };
                match incoming {
                    Some(message) => shared.handle_message(message),
                    None => {
                        rx = None;
                        shared.on_transport_closed();
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let Some(shared) = shared.upgrade() else { break };
                match command {
                    Command::Flush(key) => {
                        if let Some(doc) = shared.doc_state(&key.0, &key.1) {
                            doc.lock().flush();
                        }
                    }
                    Command::Bind(transport) => {
                        if rx.is_some() {
                            shared.on_transport_closed();
                        }
                        let Transport { tx, rx: incoming } = transport;
                        rx = Some(incoming);
                        shared.bind(tx);
                    }
                    Command::Close => {
                        shared.close(SyncError::Closed);
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.sweep(Instant::now());
            }
        }
    }
    log::debug!("Connection driver stopped");
}

/// A client session with the authority.
///
/// Cloning is cheap; clones share one session. Document handles obtained
/// from [`Connection::get`] stay usable across [`Connection::bind`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(transport: Transport, types: TypeRegistry, config: ConnectionConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let Transport { tx, rx } = transport;
        let link = Arc::new(Link {
            outgoing: Mutex::new(Some(tx)),
            id: Mutex::new(None),
            state,
            seq: AtomicU64::new(1),
            commands: commands_tx,
        });
        let sweep_interval = config.sweep_interval;
        let shared = Arc::new(Shared {
            link,
            types,
            config,
            docs: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
        });
        tokio::spawn(drive(Arc::downgrade(&shared), rx, commands_rx, sweep_interval));
        Self { shared }
    }

    /// Connects to a [`crate::server::SyncServer`] over WebSocket.
    pub async fn connect_ws(
        url: &str,
        types: TypeRegistry,
        config: ConnectionConfig,
    ) -> Result<Self, SyncError> {
        let transport = socket::connect_ws(url).await?;
        Ok(Self::new(transport, types, config))
    }

    /// Session id assigned by the authority; `None` until the handshake.
    pub fn id(&self) -> Option<String> {
        self.shared.link.id()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.link.state.borrow()
    }

    pub async fn wait_connected(&self) -> Result<(), SyncError> {
        let mut rx = self.shared.link.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(SyncError::Closed),
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }
            rx.changed().await.map_err(|_| SyncError::Closed)?;
        }
    }

    /// The handle for a document; the same state backs every handle for
    /// the same `(collection, id)` until it is destroyed.
    pub fn get(&self, collection: &str, id: &str) -> Doc {
        self.shared.doc(collection, id)
    }

    /// Resumes the session over a new transport. Queued ops are resent and
    /// subscriptions restored once the handshake arrives.
    pub fn bind(&self, transport: Transport) {
        let _ = self.shared.link.commands.send(Command::Bind(transport));
    }

    pub fn close(&self) {
        let _ = self.shared.link.commands.send(Command::Close);
    }

    pub async fn fetch_query(&self, collection: &str, query: Value) -> Result<Vec<Doc>, SyncError> {
        let id = self.shared.next_query_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let pending = PendingQuery::Fetch {
            collection: collection.to_string(),
            query,
            reply,
        };
        self.shared.register_query(id, pending);
        let snapshots = rx.await.map_err(|_| SyncError::Closed)??;
        Ok(self.shared.ingest_results(collection, snapshots))
    }

    /// Runs `query` and keeps its results current as documents change.
    pub async fn subscribe_query(&self, collection: &str, query: Value) -> Result<Query, SyncError> {
        let id = self.shared.next_query_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(QueryState::new(id, collection, query));
        let (ready, rx) = oneshot::channel();
        let pending = PendingQuery::Live {
            state: Arc::clone(&state),
            ready: Some(ready),
        };
        self.shared.register_query(id, pending);
        rx.await.map_err(|_| SyncError::Closed)??;
        Ok(Query::new(state, Arc::downgrade(&self.shared)))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("docs", &self.shared.docs.lock().len())
            .finish()
    }
}

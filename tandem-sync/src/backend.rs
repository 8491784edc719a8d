//! The authority: single logical writer for every document.
//!
//! A `Backend` owns the store, the channel bus, the type registry, the
//! middleware chains and the projections defined over collections.
//! Sessions ([`crate::agent`]) register themselves when they start and
//! deregister when they end; the backend keeps no handle to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tandem_ot::TypeRegistry;
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::client::{Connection, ConnectionConfig};
use crate::error::SyncError;
use crate::middleware::{Action, Middleware, Request};
use crate::op::{self, Op, Snapshot};
use crate::projection::Projection;
use crate::protocol::{Message, PresenceMessage};
use crate::pubsub::{collection_channel, doc_channel, PubSub, Subscription};
use crate::storage::{MemoryStore, Store};
use crate::submit::{SubmitOutcome, SubmitRequest, Submission};
use crate::transport::Transport;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Retries after a version conflict before failing with
    /// `MaxRetriesExceeded`. `None` retries forever.
    pub max_submit_retries: Option<u32>,
    /// Commit without publishing to the channel bus.
    pub suppress_publish: bool,
    /// Quiet period before a live query re-runs after collection activity.
    pub query_debounce: Duration,
    /// Messages a subscriber may fall behind before it starts losing them.
    pub channel_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_submit_retries: Some(50),
            suppress_publish: false,
            query_debounce: Duration::from_millis(20),
            channel_capacity: 1024,
        }
    }
}

/// What a subscription starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeStart {
    Snapshot(Snapshot),
    /// Ops since the version the subscriber already holds.
    Ops(Vec<Op>),
}

struct Inner {
    store: Arc<dyn Store>,
    pubsub: PubSub,
    types: TypeRegistry,
    middleware: Middleware,
    config: BackendConfig,
    /// By projection name.
    projections: RwLock<HashMap<String, Arc<Projection>>>,
    agents: AtomicUsize,
}

#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    pub fn new(store: Arc<dyn Store>, types: TypeRegistry, config: BackendConfig) -> Self {
        let pubsub = PubSub::new(config.channel_capacity);
        log::info!("Backend ready with types {:?}", types.uris());
        Self {
            inner: Arc::new(Inner {
                store,
                pubsub,
                types,
                middleware: Middleware::new(),
                config,
                projections: RwLock::new(HashMap::new()),
                agents: AtomicUsize::new(0),
            }),
        }
    }

    /// In-memory store, default types and configuration.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            TypeRegistry::with_defaults(),
            BackendConfig::default(),
        )
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.inner.pubsub
    }

    pub fn middleware(&self) -> &Middleware {
        &self.inner.middleware
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    /// Registers a middleware handler for `action`.
    pub fn use_middleware<F>(&self, action: Action, handler: F)
    where
        F: Fn(&mut Request) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        self.inner.middleware.add(action, handler);
    }

    /// Defines `name` as a view of `target` that only exposes `fields`.
    pub fn add_projection<I, S>(&self, name: &str, target: &str, fields: I) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut projections = self.inner.projections.write();
        if projections.contains_key(name) {
            return Err(SyncError::Projection(format!("{name} is already defined")));
        }
        if projections.contains_key(target) {
            return Err(SyncError::Projection(format!("{target} is itself a projection")));
        }
        let projection = Projection::new(name, target, fields);
        log::info!("Projection {name} of {target} exposes {:?}", projection.fields);
        projections.insert(name.to_string(), Arc::new(projection));
        Ok(())
    }

    pub fn projection(&self, name: &str) -> Option<Arc<Projection>> {
        self.inner.projections.read().get(name).cloned()
    }

    /// The collection documents of `collection` are stored in, and the
    /// projection in between if there is one.
    pub(crate) fn resolve(&self, collection: &str) -> (String, Option<Arc<Projection>>) {
        match self.projection(collection) {
            Some(projection) => (projection.target.clone(), Some(projection)),
            None => (collection.to_string(), None),
        }
    }

    // ─── Writes ───────────────────────────────────────────────────────

    pub async fn submit(
        &self,
        agent: Option<&str>,
        collection: &str,
        id: &str,
        submission: Submission,
    ) -> Result<SubmitOutcome, SyncError> {
        let (target, projection) = self.resolve(collection);
        SubmitRequest::new(self, agent, &target, id, submission)
            .projection(projection)
            .run()
            .await
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Current snapshot. A document that does not exist comes back with
    /// `type_uri == None`.
    pub async fn fetch(&self, agent: Option<&str>, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        let (target, projection) = self.resolve(collection);
        let snapshot = self.inner.store.get_snapshot(&target, id).await?;
        let mut snapshots = self.read_snapshots(agent, &target, projection.as_deref(), vec![snapshot])?;
        snapshots.pop().ok_or_else(|| SyncError::NotFound(format!("{collection}.{id}")))
    }

    pub async fn fetch_bulk(
        &self,
        agent: Option<&str>,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Snapshot>, SyncError> {
        let (target, projection) = self.resolve(collection);
        let snapshots = self.inner.store.get_snapshot_bulk(&target, ids).await?;
        let snapshots = self.read_snapshots(agent, &target, projection.as_deref(), snapshots.into_values().collect())?;
        Ok(snapshots.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    /// The snapshot as it stood at `version`, rebuilt from the op log.
    pub async fn fetch_snapshot(
        &self,
        agent: Option<&str>,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> Result<Snapshot, SyncError> {
        let Some(version) = version else {
            return self.fetch(agent, collection, id).await;
        };
        let (target, projection) = self.resolve(collection);
        let current = self.inner.store.get_snapshot(&target, id).await?;
        if version > current.v {
            return Err(SyncError::VersionMismatch(format!(
                "Requested version {version} of {collection}.{id}, latest is {}",
                current.v
            )));
        }
        let mut snapshot = Snapshot::empty(id);
        for op in self.inner.store.get_ops(&target, id, 0, Some(version)).await? {
            op::apply(&self.inner.types, &mut snapshot, &op)?;
        }
        let mut snapshots = self.read_snapshots(agent, &target, projection.as_deref(), vec![snapshot])?;
        snapshots.pop().ok_or_else(|| SyncError::NotFound(format!("{collection}.{id}")))
    }

    /// Ops with `from <= v < to`, projected and passed through the `Op`
    /// middleware.
    pub async fn get_ops(
        &self,
        agent: Option<&str>,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, SyncError> {
        let (target, _) = self.resolve(collection);
        let ops = self.get_ops_raw(&target, id, from, to).await?;
        ops.into_iter()
            .map(|op| self.sanitize_op(agent, collection, id, op))
            .collect()
    }

    pub(crate) async fn get_ops_raw(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, SyncError> {
        Ok(self.inner.store.get_ops(collection, id, from, to).await?)
    }

    /// Prepares an op about to leave the authority for a reader of
    /// `collection`: projects it, then runs the `Op` middleware.
    pub fn sanitize_op(&self, agent: Option<&str>, collection: &str, id: &str, mut op: Op) -> Result<Op, SyncError> {
        let (target, projection) = self.resolve(collection);
        if let Some(projection) = &projection {
            projection.project_op(&mut op)?;
        }
        if !self.inner.middleware.has(Action::Op) {
            return Ok(op);
        }
        let mut request = Request::new(Action::Op, target).agent(agent).doc(id);
        request.op = Some(op);
        self.inner.middleware.trigger(&mut request)?;
        request
            .op
            .ok_or_else(|| SyncError::Rejected("Op middleware removed the op".into()))
    }

    fn read_snapshots(
        &self,
        agent: Option<&str>,
        collection: &str,
        projection: Option<&Projection>,
        mut snapshots: Vec<Snapshot>,
    ) -> Result<Vec<Snapshot>, SyncError> {
        if let Some(projection) = projection {
            for snapshot in &mut snapshots {
                projection.project_snapshot(snapshot)?;
            }
        }
        if !self.inner.middleware.has(Action::ReadSnapshots) {
            return Ok(snapshots);
        }
        let mut request = Request::new(Action::ReadSnapshots, collection).agent(agent);
        request.snapshots = snapshots;
        self.inner.middleware.trigger(&mut request)?;
        Ok(request.snapshots)
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Attaches to the document channel, then reads the starting point.
    ///
    /// Attaching first means no commit can fall between the read and the
    /// subscription; a commit that lands in both arrives twice and the
    /// subscriber drops it by version.
    pub async fn subscribe(
        &self,
        agent: Option<&str>,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> Result<(Subscription, SubscribeStart), SyncError> {
        let (target, _) = self.resolve(collection);
        let subscription = self.inner.pubsub.subscribe(&doc_channel(&target, id));
        let start = match version {
            None => SubscribeStart::Snapshot(self.fetch(agent, collection, id).await?),
            Some(v) => SubscribeStart::Ops(self.get_ops(agent, collection, id, v, None).await?),
        };
        Ok((subscription, start))
    }

    pub async fn query_fetch(
        &self,
        agent: Option<&str>,
        collection: &str,
        query: &Value,
    ) -> Result<Vec<Snapshot>, SyncError> {
        let (target, projection) = self.resolve(collection);
        let mut request = Request::new(Action::Query, target.as_str()).agent(agent);
        request.query = Some(query.clone());
        self.inner.middleware.trigger(&mut request)?;
        let query = request.query.unwrap_or(Value::Null);

        let results = self.inner.store.query(&target, &query).await?;
        self.read_snapshots(agent, &target, projection.as_deref(), results)
    }

    /// Attaches to the collection channel, then runs the query once.
    pub async fn query_subscribe(
        &self,
        agent: Option<&str>,
        collection: &str,
        query: &Value,
    ) -> Result<(Subscription, Vec<Snapshot>), SyncError> {
        let (target, _) = self.resolve(collection);
        let subscription = self.inner.pubsub.subscribe(&collection_channel(&target));
        let results = self.query_fetch(agent, collection, query).await?;
        Ok((subscription, results))
    }

    /// Broadcasts presence to the document channel only. Sessions pass on
    /// presence sent under the collection name they subscribed with.
    pub fn publish_presence(&self, presence: PresenceMessage) -> usize {
        let (target, _) = self.resolve(&presence.c);
        let channel = doc_channel(&target, &presence.d);
        self.inner.pubsub.publish(&[channel], Arc::new(Message::Presence(presence)))
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Serves one session over `transport` until either side closes.
    pub fn listen(&self, transport: Transport) -> JoinHandle<()> {
        let agent = Agent::new(self.clone(), transport);
        tokio::spawn(agent.run())
    }

    /// An in-process client session.
    pub fn connect(&self) -> Connection {
        self.connect_with(ConnectionConfig::default())
    }

    pub fn connect_with(&self, config: ConnectionConfig) -> Connection {
        let (client, server) = Transport::pair();
        self.listen(server);
        Connection::new(client, self.inner.types.clone(), config)
    }

    pub fn agents_count(&self) -> usize {
        self.inner.agents.load(Ordering::Relaxed)
    }

    pub(crate) fn agent_started(&self) {
        self.inner.agents.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn agent_stopped(&self) {
        self.inner.agents.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("types", &self.inner.types)
            .field("config", &self.inner.config)
            .field("agents", &self.agents_count())
            .finish()
    }
}

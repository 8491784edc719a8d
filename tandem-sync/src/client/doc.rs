//! Client-side document handle.
//!
//! Local changes are applied immediately and queued; the queue goes to the
//! authority one op at a time:
//!
//! ```text
//! submit_op ─► apply locally ─► pending ──(next tick)──► in-flight ──► ack: version + 1
//!                                  ▲                         │
//!                                  │                         ├─► rejected, invertible: soft rollback
//!                          remote ops transform              └─► otherwise: hard rollback (refetch)
//!                          pending and in-flight
//! ```
//!
//! All state sits behind one mutex so a local change is visible the moment
//! the call returns. Completion is reported through [`Ack`] and state
//! transitions through [`DocEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tandem_ot::{OtType, Side, TypeRegistry};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use crate::error::SyncError;
use crate::op::{CreateOp, OpKind, Snapshot};
use crate::protocol::{DocRequest, Message, OpMessage, PresenceMessage};

use super::connection::{Link, Shared};
use super::presence::{Author, DocPresence, PresenceChange};
use super::undo::{Record, UndoStack};

pub(crate) type DocKey = (String, String);

#[derive(Debug, Clone)]
pub struct DocConfig {
    /// How long committed ops stay available for transforming presence
    /// that refers to an older version.
    pub cached_ops_timeout: Duration,
    /// How long a peer's presence is kept without news from it.
    pub received_presence_timeout: Duration,
    /// Capacity of each handle's event channel.
    pub event_capacity: usize,
    /// Changes kept on each of the undo and redo stacks; 0 keeps all.
    pub undo_limit: usize,
}

impl Default for DocConfig {
    fn default() -> Self {
        Self {
            cached_ops_timeout: Duration::from_secs(60),
            received_presence_timeout: Duration::from_secs(60),
            event_capacity: 256,
            undo_limit: 100,
        }
    }
}

/// How a local edit is handled besides being applied and sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Record the edit so [`Doc::undo`] can revert it. Requires a type
    /// that can invert.
    pub undoable: bool,
    /// Fold the edit into the most recent undoable change, so one undo
    /// reverts both.
    pub fix_up: bool,
    /// Resolve at once, without applying or sending, when the edit
    /// changes nothing.
    pub skip_noop: bool,
}

impl SubmitOptions {
    pub fn undoable() -> Self {
        Self {
            undoable: true,
            ..Self::default()
        }
    }

    fn record(&self) -> Record {
        if self.fix_up {
            Record::FixUp
        } else if self.undoable {
            Record::Undoable
        } else {
            Record::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// A snapshot replaced the local state.
    Load,
    Create { source: Source },
    Delete { data: Value, source: Source },
    Op { op: Value, source: Source },
    /// The in-flight op was committed at version `v`.
    Acknowledged { v: u64 },
    RolledBack { hard: bool },
    /// A peer's presence changed; `None` means it is gone.
    Presence { src: String, value: Option<Value> },
    NothingPending,
    /// A failure no caller was waiting for.
    Error(SyncError),
}

type Reply = oneshot::Sender<Result<(), SyncError>>;

pub(crate) enum Waiter {
    Reply(Reply),
    /// Completes a hard rollback once the resynchronizing fetch returns.
    Rollback {
        waiters: Vec<Waiter>,
        err: Option<SyncError>,
    },
}

struct PendingOp {
    kind: OpKind,
    /// Type the op was written against.
    ty: Option<Arc<dyn OtType>>,
    src: Option<String>,
    seq: Option<u64>,
    /// Has been sent at least once; never composed into after that.
    sent: bool,
    waiters: Vec<Waiter>,
}

/// Resolves when the authority accepted or refused a local change.
///
/// Dropping it does not cancel anything; the change stays queued.
#[derive(Debug)]
pub struct Ack {
    rx: oneshot::Receiver<Result<(), SyncError>>,
}

impl Ack {
    fn channel() -> (Reply, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn ready(result: Result<(), SyncError>) -> Self {
        let (tx, ack) = Self::channel();
        let _ = tx.send(result);
        ack
    }
}

impl Future for Ack {
    type Output = Result<(), SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SyncError::Closed)))
    }
}

pub(crate) struct DocState {
    collection: String,
    id: String,
    link: Arc<Link>,
    types: TypeRegistry,
    config: DocConfig,

    version: Option<u64>,
    ty: Option<Arc<dyn OtType>>,
    data: Value,

    want_subscribe: bool,
    subscribed: bool,
    /// Requests sent, with the version they were sent at.
    inflight_fetch: VecDeque<(Option<u64>, Vec<Waiter>)>,
    inflight_subscribe: VecDeque<(Option<u64>, Vec<Waiter>)>,
    inflight_unsubscribe: VecDeque<Vec<Waiter>>,
    /// Requests waiting for a connection.
    pending_fetch: Vec<Waiter>,
    pending_subscribe: Vec<Waiter>,
    /// Fetches that must wait for the local create to be acknowledged.
    deferred_fetch: Vec<Waiter>,

    inflight_op: Option<PendingOp>,
    pending_ops: VecDeque<PendingOp>,
    paused: bool,

    nothing_pending: Vec<oneshot::Sender<()>>,
    events: broadcast::Sender<DocEvent>,
    presence: DocPresence,
    undo: UndoStack,
}

impl DocState {
    pub(crate) fn new(
        collection: &str,
        id: &str,
        link: Arc<Link>,
        types: TypeRegistry,
        config: DocConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let undo = UndoStack::new(config.undo_limit);
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            link,
            types,
            config,
            version: None,
            ty: None,
            data: Value::Null,
            want_subscribe: false,
            subscribed: false,
            inflight_fetch: VecDeque::new(),
            inflight_subscribe: VecDeque::new(),
            inflight_unsubscribe: VecDeque::new(),
            pending_fetch: Vec::new(),
            pending_subscribe: Vec::new(),
            deferred_fetch: Vec::new(),
            inflight_op: None,
            pending_ops: VecDeque::new(),
            paused: false,
            nothing_pending: Vec::new(),
            events,
            presence: DocPresence::default(),
            undo,
        }
    }

    fn key(&self) -> DocKey {
        (self.collection.clone(), self.id.clone())
    }

    fn name(&self) -> String {
        format!("{}.{}", self.collection, self.id)
    }

    fn emit(&self, event: DocEvent) {
        let _ = self.events.send(event);
    }

    fn emit_presence(&self, changes: Vec<PresenceChange>) {
        for (src, value) in changes {
            self.emit(DocEvent::Presence { src, value });
        }
    }

    pub(crate) fn has_write_pending(&self) -> bool {
        self.inflight_op.is_some() || !self.pending_ops.is_empty()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.has_write_pending()
            || !self.inflight_fetch.is_empty()
            || !self.inflight_subscribe.is_empty()
            || !self.inflight_unsubscribe.is_empty()
            || !self.pending_fetch.is_empty()
            || !self.pending_subscribe.is_empty()
            || !self.deferred_fetch.is_empty()
    }

    // ─── Waiters ──────────────────────────────────────────────────────

    /// Returns whether anybody was still listening.
    fn resolve(&self, waiter: Waiter, result: Result<(), SyncError>) -> bool {
        match waiter {
            Waiter::Reply(reply) => reply.send(result).is_ok(),
            Waiter::Rollback { waiters, err } => {
                let outcome = err.clone().map_or(Ok(()), Err);
                let observed = waiters
                    .into_iter()
                    .fold(false, |seen, w| self.resolve(w, outcome.clone()) || seen);
                if let Some(err) = err {
                    if !observed {
                        self.emit(DocEvent::Error(err));
                    }
                }
                if let Err(fetch_err) = result {
                    log::error!("Resynchronizing {} failed: {fetch_err}", self.name());
                    self.emit(DocEvent::Error(fetch_err));
                }
                true
            }
        }
    }

    fn resolve_all(&self, waiters: Vec<Waiter>, result: Result<(), SyncError>) {
        for waiter in waiters {
            self.resolve(waiter, result.clone());
        }
    }

    fn emit_nothing_pending(&mut self) {
        if !self.has_write_pending() {
            if !self.deferred_fetch.is_empty() {
                let waiters = std::mem::take(&mut self.deferred_fetch);
                self.fetch(waiters);
            }
            if self.presence.unsent {
                self.send_presence(false);
            }
        }
        if self.has_pending() {
            return;
        }
        for tx in self.nothing_pending.drain(..) {
            let _ = tx.send(());
        }
        self.emit(DocEvent::NothingPending);
    }

    // ─── Fetch and subscribe ──────────────────────────────────────────

    pub(crate) fn fetch(&mut self, waiters: Vec<Waiter>) {
        if !self.link.can_send() {
            self.pending_fetch.extend(waiters);
            return;
        }
        // Join a request already on its way for the same version.
        if let Some((v, group)) = self.inflight_fetch.back_mut() {
            if *v == self.version {
                group.extend(waiters);
                return;
            }
        }
        self.link.send(Message::Fetch(DocRequest::new(&self.collection, &self.id, self.version)));
        self.inflight_fetch.push_back((self.version, waiters));
    }

    pub(crate) fn subscribe(&mut self, waiters: Vec<Waiter>) {
        self.want_subscribe = true;
        if !self.link.can_send() {
            self.pending_subscribe.extend(waiters);
            return;
        }
        if let Some((v, group)) = self.inflight_subscribe.back_mut() {
            if *v == self.version {
                group.extend(waiters);
                return;
            }
        }
        self.link
            .send(Message::Subscribe(DocRequest::new(&self.collection, &self.id, self.version)));
        self.inflight_subscribe.push_back((self.version, waiters));
    }

    pub(crate) fn unsubscribe(&mut self, waiters: Vec<Waiter>) {
        self.want_subscribe = false;
        if !self.link.can_send() {
            // The authority forgets subscriptions of a closed session.
            self.subscribed = false;
            self.resolve_all(waiters, Ok(()));
            return;
        }
        self.link
            .send(Message::Unsubscribe(DocRequest::new(&self.collection, &self.id, None)));
        self.inflight_unsubscribe.push_back(waiters);
    }

    pub(crate) fn handle_fetch(&mut self, reply: DocRequest) {
        let (_, waiters) = self.inflight_fetch.pop_front().unwrap_or_default();
        match reply.error {
            Some(payload) => self.resolve_all(waiters, Err(SyncError::from_payload(&payload))),
            None => self.ingest_snapshot(reply.data, waiters),
        }
        self.emit_nothing_pending();
    }

    pub(crate) fn handle_subscribe(&mut self, reply: DocRequest) {
        let (_, waiters) = self.inflight_subscribe.pop_front().unwrap_or_default();
        if let Some(payload) = reply.error {
            self.resolve_all(waiters, Err(SyncError::from_payload(&payload)));
            self.emit_nothing_pending();
            return;
        }
        if self.want_subscribe {
            self.subscribed = true;
        }
        self.ingest_snapshot(reply.data, waiters);
        if self.subscribed && (self.presence.enabled || self.presence.unsent) {
            // Peers may have changed while we were away.
            self.send_presence(true);
        }
        self.emit_nothing_pending();
    }

    pub(crate) fn handle_unsubscribe(&mut self, reply: DocRequest) {
        let waiters = self.inflight_unsubscribe.pop_front().unwrap_or_default();
        match reply.error {
            Some(payload) => self.resolve_all(waiters, Err(SyncError::from_payload(&payload))),
            None => {
                if !self.want_subscribe {
                    self.subscribed = false;
                }
                self.resolve_all(waiters, Ok(()));
            }
        }
        self.emit_nothing_pending();
    }

    /// Adopts a snapshot from a fetch, subscribe or query, unless local
    /// state is already ahead of it or has to be caught up with ops.
    pub(crate) fn ingest_snapshot(&mut self, snapshot: Option<Snapshot>, waiters: Vec<Waiter>) {
        let Some(snapshot) = snapshot else {
            if self.version.is_none() && self.ty.is_none() && !self.has_write_pending() {
                // Local state was reset while ops were on their way.
                self.fetch(waiters);
            } else {
                self.resolve_all(waiters, Ok(()));
            }
            return;
        };

        if self.ty.is_some() || self.has_write_pending() {
            match self.version {
                None if self.has_write_pending() => self.deferred_fetch.extend(waiters),
                None => self.resolve_all(
                    waiters,
                    Err(SyncError::InvalidMessage(format!(
                        "Cannot ingest snapshot of {} without a local version",
                        self.name()
                    ))),
                ),
                Some(version) if snapshot.v > version => self.fetch(waiters),
                Some(_) => self.resolve_all(waiters, Ok(())),
            }
            return;
        }

        // Never move the version backwards.
        if self.version.is_some_and(|v| v > snapshot.v) {
            self.resolve_all(waiters, Ok(()));
            return;
        }
        let ty = match snapshot.type_uri.as_deref() {
            Some(uri) => match self.types.get(uri) {
                Some(ty) => Some(ty),
                None => {
                    self.resolve_all(waiters, Err(SyncError::UnknownType(uri.to_string())));
                    return;
                }
            },
            None => None,
        };
        self.version = Some(snapshot.v);
        self.data = if ty.is_some() { snapshot.data } else { Value::Null };
        self.ty = ty;
        self.undo.clear();
        self.emit(DocEvent::Load);
        self.process_presence();
        self.resolve_all(waiters, Ok(()));
    }

    // ─── Ops ──────────────────────────────────────────────────────────

    /// Applies a local change and queues it for the authority.
    pub(crate) fn submit(&mut self, kind: OpKind, options: SubmitOptions, reply: Reply) {
        self.submit_recorded(kind, options.record(), options.skip_noop, reply);
    }

    fn submit_recorded(&mut self, kind: OpKind, record: Record, skip_noop: bool, reply: Reply) {
        let kind = match self.prepare(kind) {
            Ok(kind) => kind,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let (OpKind::Edit(op), Some(ty)) = (&kind, &self.ty) {
            if skip_noop && ty.is_noop(op) {
                let _ = reply.send(Ok(()));
                return;
            }
            if record != Record::Skip && !ty.can_invert() {
                let _ = reply.send(Err(SyncError::InvertUnsupported(ty.uri().to_string())));
                return;
            }
        }
        if let Err(e) = self.ot_apply(&kind, Source::Local, Author::Local, record) {
            let _ = reply.send(Err(e));
            return;
        }
        if !self.try_compose(&kind) {
            self.pending_ops.push_back(PendingOp {
                kind,
                ty: self.ty.clone(),
                src: None,
                seq: None,
                sent: false,
                waiters: vec![Waiter::Reply(reply)],
            });
        } else if let Some(last) = self.pending_ops.back_mut() {
            last.waiters.push(Waiter::Reply(reply));
        }
        // Flushed on the connection's next turn so synchronous submits
        // batch into one op.
        self.link.schedule_flush(self.key());
    }

    fn prepare(&self, kind: OpKind) -> Result<OpKind, SyncError> {
        match kind {
            OpKind::Edit(op) => {
                let ty = self.ty.as_ref().ok_or_else(|| SyncError::NotFound(self.name()))?;
                Ok(OpKind::Edit(ty.normalize(op)?))
            }
            OpKind::Create(create) => {
                if self.ty.is_some() {
                    return Err(SyncError::AlreadyExists(self.name()));
                }
                let ty = self
                    .types
                    .get(&create.type_uri)
                    .ok_or_else(|| SyncError::UnknownType(create.type_uri.clone()))?;
                Ok(OpKind::Create(CreateOp {
                    type_uri: ty.uri().to_string(),
                    data: create.data,
                }))
            }
            OpKind::Del if self.ty.is_none() => Err(SyncError::NotFound(self.name())),
            other => Ok(other),
        }
    }

    fn try_compose(&mut self, kind: &OpKind) -> bool {
        let current = self.ty.clone();
        let Some(last) = self.pending_ops.back_mut() else {
            return false;
        };
        if last.sent {
            return false;
        }
        let Some(ty) = current else {
            return false;
        };
        match (&mut last.kind, kind) {
            (OpKind::Create(create), OpKind::Edit(op)) if create.type_uri == ty.uri() => {
                let composed = ty
                    .create(create.data.clone())
                    .and_then(|initial| ty.apply(&initial, op));
                match composed {
                    Ok(data) => {
                        create.data = Some(data);
                        true
                    }
                    Err(_) => false,
                }
            }
            (OpKind::Edit(first), OpKind::Edit(second))
                if ty.can_compose() && last.ty.as_ref().is_some_and(|t| t.uri() == ty.uri()) =>
            {
                match ty.compose(first, second) {
                    Ok(composed) => {
                        *first = composed;
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Applies an op to local data. Nothing changes when it fails.
    fn ot_apply(
        &mut self,
        kind: &OpKind,
        source: Source,
        author: Author<'_>,
        record: Record,
    ) -> Result<(), SyncError> {
        match kind {
            OpKind::Edit(op) => {
                let ty = self.ty.clone().ok_or_else(|| SyncError::NotFound(self.name()))?;
                if record == Record::Skip {
                    self.data = ty.apply(&self.data, op)?;
                    self.undo.transform(op, &ty);
                } else {
                    let (data, inverse) = ty.apply_and_invert(&self.data, op)?;
                    self.data = data;
                    self.undo.record(record, inverse, &ty);
                }
                self.emit(DocEvent::Op {
                    op: op.clone(),
                    source,
                });
            }
            OpKind::Create(create) => {
                let ty = self.types.require(&create.type_uri)?;
                self.data = ty.create(create.data.clone())?;
                self.ty = Some(ty);
                self.undo.clear();
                self.emit(DocEvent::Create { source });
            }
            OpKind::Del => {
                let data = std::mem::take(&mut self.data);
                self.ty = None;
                self.undo.clear();
                self.emit(DocEvent::Delete { data, source });
            }
            OpKind::Noop => return Ok(()),
        }
        let changes = self.presence.transform(kind, author, self.ty.as_ref());
        self.emit_presence(changes);
        Ok(())
    }

    pub(crate) fn flush(&mut self) {
        if !self.link.can_send() || self.inflight_op.is_some() || self.paused {
            return;
        }
        let Some(mut op) = self.pending_ops.pop_front() else {
            return;
        };
        if op.src.is_none() {
            op.src = self.link.id();
        }
        if op.seq.is_none() {
            op.seq = Some(self.link.next_seq());
        }
        op.sent = true;
        self.link.send(Message::Op(OpMessage {
            c: self.collection.clone(),
            d: self.id.clone(),
            v: self.version,
            src: op.src.clone(),
            seq: op.seq,
            kind: op.kind.clone(),
            error: None,
        }));
        self.inflight_op = Some(op);
    }

    pub(crate) fn handle_op(&mut self, msg: OpMessage) {
        if let Some(payload) = &msg.error {
            let err = SyncError::from_payload(payload);
            if self.inflight_op.is_some() {
                // A middleware refusal is part of normal operation.
                let err = (!matches!(err, SyncError::Rejected(_))).then_some(err);
                self.rollback(err);
            } else {
                self.emit(DocEvent::Error(err));
            }
            return;
        }

        if let Some(inflight) = &self.inflight_op {
            if msg.src.is_some() && inflight.src == msg.src && inflight.seq == msg.seq {
                self.op_acknowledged(msg.v);
                return;
            }
        }

        let Some(v) = msg.v else {
            log::debug!("Ignoring op without version on {}", self.name());
            return;
        };
        match self.version {
            None => {
                self.fetch(Vec::new());
                return;
            }
            Some(version) if v > version => {
                log::debug!("Version gap on {}: at v{version}, got v{v}", self.name());
                self.fetch(Vec::new());
                return;
            }
            // Already seen.
            Some(version) if v < version => return,
            Some(_) => {}
        }

        let src = msg.src.unwrap_or_default();
        // Presence received later refers to the committed op, not to the
        // one rewritten past local changes.
        let committed = msg.kind.clone();
        let mut remote = msg.kind;
        if let Err(e) = self.transform_local_ops(&mut remote) {
            self.hard_rollback(Some(e));
            return;
        }
        self.version = Some(v + 1);
        if let Err(e) = self.ot_apply(&remote, Source::Remote, Author::Remote(&src), Record::Skip) {
            self.hard_rollback(Some(e));
            return;
        }
        self.presence.cache_op(v, committed, src, Instant::now());
        self.process_presence();
    }

    fn transform_local_ops(&mut self, remote: &mut OpKind) -> Result<(), SyncError> {
        if let Some(inflight) = self.inflight_op.as_mut() {
            transform_x(inflight, remote)?;
        }
        for pending in self.pending_ops.iter_mut() {
            transform_x(pending, remote)?;
        }
        Ok(())
    }

    fn op_acknowledged(&mut self, v: Option<u64>) {
        let is_create = self
            .inflight_op
            .as_ref()
            .is_some_and(|op| matches!(op.kind, OpKind::Create(_)));
        if is_create {
            self.version = v.or(self.version);
            self.presence.clear_cached_ops();
        } else if v != self.version {
            // Ops before ours went missing; fetching them brings our own
            // op again, which then matches.
            log::warn!(
                "Unexpected acknowledgement on {}: at {:?}, acknowledged at {v:?}",
                self.name(),
                self.version
            );
            self.fetch(Vec::new());
            return;
        }
        let Some(committed) = self.version else {
            self.fetch(Vec::new());
            return;
        };
        let Some(op) = self.inflight_op.take() else {
            return;
        };
        self.version = Some(committed + 1);
        self.presence.cache_op(
            committed,
            op.kind,
            op.src.unwrap_or_default(),
            Instant::now(),
        );
        self.emit(DocEvent::Acknowledged { v: committed });
        self.resolve_all(op.waiters, Ok(()));
        self.process_presence();
        self.flush();
        self.emit_nothing_pending();
    }

    /// Undoes a refused in-flight op locally with its inverse.
    fn rollback(&mut self, err: Option<SyncError>) {
        let Some(op) = self.inflight_op.take() else {
            return;
        };
        let inverse = match (&op.kind, &op.ty) {
            (OpKind::Edit(edit), Some(ty)) if ty.can_invert() => ty.invert(edit).ok(),
            _ => None,
        };
        let Some(inverse) = inverse else {
            self.inflight_op = Some(op);
            self.hard_rollback(err);
            return;
        };

        let mut inverse = OpKind::Edit(inverse);
        let mut result = Ok(());
        for pending in self.pending_ops.iter_mut() {
            result = transform_x(pending, &mut inverse);
            if result.is_err() {
                break;
            }
        }
        let result = result
            .and_then(|_| self.ot_apply(&inverse, Source::Remote, Author::Remote(""), Record::Skip));
        if let Err(e) = result {
            self.inflight_op = Some(op);
            self.hard_rollback(Some(e));
            return;
        }

        log::debug!("Rolled back refused op on {}", self.name());
        self.emit(DocEvent::RolledBack { hard: false });
        self.resolve_all(op.waiters, err.map_or(Ok(()), Err));
        self.flush();
        self.emit_nothing_pending();
    }

    /// Throws away all optimistic state and refetches. Every queued change
    /// fails with `err` once the fetch is back.
    fn hard_rollback(&mut self, err: Option<SyncError>) {
        match &err {
            Some(e) => log::warn!("Hard rollback of {}: {e}", self.name()),
            None => log::warn!("Hard rollback of {}", self.name()),
        }
        let mut waiters = Vec::new();
        if let Some(op) = self.inflight_op.take() {
            waiters.extend(op.waiters);
        }
        for op in self.pending_ops.drain(..) {
            waiters.extend(op.waiters);
        }
        self.ty = None;
        self.version = None;
        self.data = Value::Null;
        self.undo.clear();
        self.presence.local = None;
        self.presence.clear_cached_ops();
        // Peers' cursors are gone with the state; ask for them again.
        self.presence.request_reply = true;
        let changes = self.presence.clear_remote();
        self.emit_presence(changes);
        self.emit(DocEvent::RolledBack { hard: true });
        self.fetch(vec![Waiter::Rollback { waiters, err }]);
    }

    // ─── Undo ─────────────────────────────────────────────────────────

    pub(crate) fn undo(&mut self, reply: Reply) {
        match self.undo.pop_undo() {
            Some(op) => self.submit_recorded(OpKind::Edit(op), Record::Undo, false, reply),
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    pub(crate) fn redo(&mut self, reply: Reply) {
        match self.undo.pop_redo() {
            Some(op) => self.submit_recorded(OpKind::Edit(op), Record::Redo, false, reply),
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub(crate) fn submit_presence(&mut self, value: Value, reply: Reply) {
        let ty = match self.ty.as_ref() {
            Some(ty) if ty.supports_presence() => Arc::clone(ty),
            Some(ty) => {
                let _ = reply.send(Err(SyncError::PresenceUnsupported(ty.uri().to_string())));
                return;
            }
            None => {
                let _ = reply.send(Err(SyncError::NotFound(self.name())));
                return;
            }
        };
        if !self.want_subscribe {
            let _ = reply.send(Err(SyncError::NotSubscribed(self.name())));
            return;
        }
        let value = if value.is_null() {
            None
        } else {
            match ty.create_presence(value) {
                Ok(value) => Some(value),
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
            }
        };
        self.presence.local = value;
        self.presence.enabled = true;
        self.presence.wait(reply);
        self.send_presence(false);
    }

    pub(crate) fn request_presence(&mut self) {
        self.presence.enabled = true;
        self.send_presence(true);
    }

    /// Sends the local presence, or remembers to once it would refer to a
    /// version peers can see.
    fn send_presence(&mut self, request_reply: bool) {
        let Some(version) = self.version else {
            self.presence.unsent = true;
            self.presence.request_reply |= request_reply;
            return;
        };
        if !self.link.can_send() || !self.subscribed || self.has_write_pending() {
            self.presence.unsent = true;
            self.presence.request_reply |= request_reply;
            return;
        }
        let r = request_reply || std::mem::take(&mut self.presence.request_reply);
        self.presence.unsent = false;
        let seq = self.presence.next_seq();
        self.link.send(Message::Presence(PresenceMessage {
            c: self.collection.clone(),
            d: self.id.clone(),
            src: None,
            seq,
            v: Some(version),
            p: self.presence.local.clone().unwrap_or(Value::Null),
            r,
            error: None,
        }));
    }

    pub(crate) fn handle_presence(&mut self, msg: PresenceMessage) {
        if msg.src.is_none() {
            let result = msg
                .error
                .as_ref()
                .map_or(Ok(()), |e| Err(SyncError::from_payload(e)));
            self.presence.ack(msg.seq, result);
            return;
        }
        if msg.r && self.presence.local.is_some() {
            self.send_presence(false);
        }
        if let Some(change) = self.presence.receive(msg, Instant::now()) {
            self.emit_presence(vec![change]);
        }
        self.process_presence();
    }

    fn process_presence(&mut self) {
        let local_ops: Vec<&OpKind> = self
            .inflight_op
            .iter()
            .chain(self.pending_ops.iter())
            .map(|op| &op.kind)
            .collect();
        let changes =
            self.presence
                .process_received(self.version, self.ty.as_ref(), &local_ops, Instant::now());
        self.emit_presence(changes);
    }

    pub(crate) fn sweep(&mut self, now: Instant) {
        let changes = self.presence.sweep(now, &self.config);
        self.emit_presence(changes);
    }

    // ─── Connection state ─────────────────────────────────────────────

    pub(crate) fn on_connected(&mut self) {
        let fetches = std::mem::take(&mut self.pending_fetch);
        let subscribes = std::mem::take(&mut self.pending_subscribe);
        if self.want_subscribe {
            let mut waiters = subscribes;
            waiters.extend(fetches);
            self.subscribe(waiters);
        } else {
            self.resolve_all(subscribes, Ok(()));
            if !fetches.is_empty() {
                self.fetch(fetches);
            }
        }
        self.flush();
    }

    pub(crate) fn on_disconnected(&mut self) {
        // Resent with the same src and seq, so the authority can spot it
        // if it was committed already.
        if let Some(op) = self.inflight_op.take() {
            self.pending_ops.push_front(op);
        }
        self.subscribed = false;
        for (_, group) in self.inflight_subscribe.drain(..) {
            self.pending_subscribe.extend(group);
        }
        for (_, group) in self.inflight_fetch.drain(..) {
            self.pending_fetch.extend(group);
        }
        let unsubscribes: Vec<Waiter> = self.inflight_unsubscribe.drain(..).flatten().collect();
        self.resolve_all(unsubscribes, Ok(()));
        self.presence.fail_all(SyncError::Closed);
        if self.presence.local.is_some() {
            self.presence.unsent = true;
        }
        let changes = self.presence.clear_remote();
        self.emit_presence(changes);
    }

    /// The connection is gone for good: nothing queued can complete.
    pub(crate) fn on_closed(&mut self) {
        self.on_disconnected();
        let mut waiters: Vec<Waiter> = self.pending_fetch.drain(..).collect();
        waiters.append(&mut self.pending_subscribe);
        waiters.append(&mut self.deferred_fetch);
        for op in self.pending_ops.drain(..) {
            waiters.extend(op.waiters);
        }
        self.resolve_all(waiters, Err(SyncError::Closed));
        self.emit_nothing_pending();
    }
}

/// Transforms a local op and a committed remote op past each other.
fn transform_x(client: &mut PendingOp, server: &mut OpKind) -> Result<(), SyncError> {
    // A local delete wins; whatever the remote did no longer matters.
    if matches!(client.kind, OpKind::Del) {
        *server = OpKind::Noop;
        return Ok(());
    }
    let server_op = match server {
        OpKind::Del => return Err(SyncError::DeletedRemotely),
        OpKind::Create(_) => return Err(SyncError::CreatedRemotely),
        OpKind::Noop => return Ok(()),
        OpKind::Edit(op) => op,
    };
    match &mut client.kind {
        OpKind::Create(_) => Err(SyncError::CreatedRemotely),
        OpKind::Edit(client_op) => {
            let ty = client
                .ty
                .as_ref()
                .ok_or_else(|| SyncError::TransformFailure("Local op has no type".into()))?;
            let client_next = ty.transform(client_op, server_op, Side::Left)?;
            let server_next = ty.transform(server_op, client_op, Side::Right)?;
            *client_op = client_next;
            *server_op = server_next;
            Ok(())
        }
        OpKind::Del | OpKind::Noop => Ok(()),
    }
}

/// A document as seen by one connection.
///
/// Handles are cheap to clone; all clones share the same state. The
/// connection owns the state; a handle only refers back to it.
#[derive(Clone)]
pub struct Doc {
    state: Arc<Mutex<DocState>>,
    shared: Weak<Shared>,
    key: Arc<DocKey>,
}

impl Doc {
    pub(crate) fn new(state: Arc<Mutex<DocState>>, shared: Weak<Shared>, key: DocKey) -> Self {
        Self {
            state,
            shared,
            key: Arc::new(key),
        }
    }

    pub fn collection(&self) -> &str {
        &self.key.0
    }

    pub fn id(&self) -> &str {
        &self.key.1
    }

    pub fn version(&self) -> Option<u64> {
        self.state.lock().version
    }

    pub fn data(&self) -> Value {
        self.state.lock().data.clone()
    }

    pub fn type_uri(&self) -> Option<&'static str> {
        self.state.lock().ty.as_ref().map(|ty| ty.uri())
    }

    pub fn exists(&self) -> bool {
        self.state.lock().ty.is_some()
    }

    pub fn subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().has_pending()
    }

    pub fn has_write_pending(&self) -> bool {
        self.state.lock().has_write_pending()
    }

    /// Peers' presence, transformed to the local data.
    pub fn presence(&self) -> HashMap<String, Value> {
        self.state.lock().presence.remote()
    }

    pub fn local_presence(&self) -> Option<Value> {
        self.state.lock().presence.local.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<DocEvent> {
        self.state.lock().events.subscribe()
    }

    pub async fn fetch(&self) -> Result<(), SyncError> {
        let (reply, ack) = Ack::channel();
        self.state.lock().fetch(vec![Waiter::Reply(reply)]);
        ack.await
    }

    pub async fn subscribe(&self) -> Result<(), SyncError> {
        let (reply, ack) = Ack::channel();
        self.state.lock().subscribe(vec![Waiter::Reply(reply)]);
        ack.await
    }

    pub async fn unsubscribe(&self) -> Result<(), SyncError> {
        let (reply, ack) = Ack::channel();
        self.state.lock().unsubscribe(vec![Waiter::Reply(reply)]);
        ack.await
    }

    /// Creates the document with `data` as its initial value. `type_name`
    /// is a registry name or URI.
    pub fn create(&self, data: Value, type_name: &str) -> Ack {
        self.submit(OpKind::Create(CreateOp {
            type_uri: type_name.to_string(),
            data: Some(data),
        }))
    }

    pub fn submit_op(&self, op: Value) -> Ack {
        self.submit(OpKind::Edit(op))
    }

    pub fn submit_op_with(&self, op: Value, options: SubmitOptions) -> Ack {
        let (reply, ack) = Ack::channel();
        self.state.lock().submit(OpKind::Edit(op), options, reply);
        ack
    }

    pub fn del(&self) -> Ack {
        self.submit(OpKind::Del)
    }

    /// Submits the edit that turns the current value into `data`.
    pub fn submit_snapshot(&self, data: Value) -> Ack {
        self.submit_snapshot_with(data, SubmitOptions::default())
    }

    pub fn submit_snapshot_with(&self, data: Value, options: SubmitOptions) -> Ack {
        let mut state = self.state.lock();
        let diff = match state.ty.as_ref() {
            None => Err(SyncError::NotFound(state.name())),
            Some(ty) if !ty.can_diff() => Err(SyncError::DiffUnsupported(ty.uri().to_string())),
            Some(ty) => ty
                .diff(&state.data, &data)
                .map(|op| (!ty.is_noop(&op)).then_some(op))
                .map_err(SyncError::from),
        };
        match diff {
            Ok(Some(op)) => {
                let (reply, ack) = Ack::channel();
                state.submit(OpKind::Edit(op), options, reply);
                ack
            }
            Ok(None) => Ack::ready(Ok(())),
            Err(e) => Ack::ready(Err(e)),
        }
    }

    fn submit(&self, kind: OpKind) -> Ack {
        let (reply, ack) = Ack::channel();
        self.state.lock().submit(kind, SubmitOptions::default(), reply);
        ack
    }

    /// Reverts the most recent undoable change, as a new local edit that
    /// goes to the authority like any other. Resolves at once when there
    /// is nothing to undo.
    pub fn undo(&self) -> Ack {
        let (reply, ack) = Ack::channel();
        self.state.lock().undo(reply);
        ack
    }

    pub fn redo(&self) -> Ack {
        let (reply, ack) = Ack::channel();
        self.state.lock().redo(reply);
        ack
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.state.lock().undo.can_redo()
    }

    pub fn clear_undo(&self) {
        self.state.lock().undo.clear();
    }

    /// Sets this session's presence on the document; `Value::Null` clears
    /// it. Requires a subscription.
    pub fn submit_presence(&self, presence: Value) -> Ack {
        let (reply, ack) = Ack::channel();
        self.state.lock().submit_presence(presence, reply);
        ack
    }

    /// Asks every peer to re-send its presence.
    pub fn request_presence(&self) {
        self.state.lock().request_presence();
    }

    /// Holds local ops back instead of sending them.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.flush();
    }

    pub async fn when_nothing_pending(&self) {
        let rx = {
            let mut state = self.state.lock();
            if !state.has_pending() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.nothing_pending.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Waits for outstanding work, unsubscribes, and forgets the document.
    pub async fn destroy(self) -> Result<(), SyncError> {
        self.when_nothing_pending().await;
        let subscribed = self.state.lock().want_subscribe;
        if subscribed {
            self.unsubscribe().await?;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.forget_doc(&self.key);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Doc")
            .field("collection", &self.key.0)
            .field("id", &self.key.1)
            .field("version", &state.version)
            .field("type", &state.ty.as_ref().map(|ty| ty.uri()))
            .finish()
    }
}

//! Presence kept by one document handle.
//!
//! Remote entries go through two stages:
//!
//! ```text
//! received (buffered at the sender's version)
//!     │  local version ≥ entry version
//!     ▼
//! transform through cached ops [v, version), then in-flight, then pending
//!     │
//!     ▼
//! remote (relative to local data, moved along by every op applied after)
//! ```
//!
//! An entry that cannot be carried forward is dropped, never guessed: the
//! cache no longer covers its version, a create or delete lies in the way,
//! or the type has no presence support.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tandem_ot::OtType;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::op::OpKind;
use crate::protocol::PresenceMessage;

use super::doc::DocConfig;

pub(crate) type PresenceReply = oneshot::Sender<Result<(), SyncError>>;

/// A presence change to report: `None` means the entry is gone.
pub(crate) type PresenceChange = (String, Option<Value>);

struct CachedOp {
    kind: OpKind,
    src: String,
    at: Instant,
}

struct Received {
    message: PresenceMessage,
    at: Instant,
}

struct RemotePresence {
    value: Value,
    at: Instant,
}

/// Who authored an op applied to the document.
#[derive(Clone, Copy)]
pub(crate) enum Author<'a> {
    Local,
    Remote(&'a str),
}

#[derive(Default)]
pub(crate) struct DocPresence {
    /// Committed ops by the version they apply from.
    cached_ops: BTreeMap<u64, CachedOp>,
    received: HashMap<String, Received>,
    remote: HashMap<String, RemotePresence>,
    /// Highest seq seen per peer; anything at or below it is stale.
    last_seq: HashMap<String, u64>,

    pub(crate) local: Option<Value>,
    local_seq: u64,
    /// Once set, the local presence is re-announced after every subscribe.
    pub(crate) enabled: bool,
    /// The local presence changed but could not be sent yet.
    pub(crate) unsent: bool,
    pub(crate) request_reply: bool,
    /// Replies for the next presence message that goes out.
    waiting: Vec<PresenceReply>,
    /// Replies for presence messages sent, by seq.
    acks: Vec<(u64, PresenceReply)>,
}

impl DocPresence {
    pub(crate) fn cache_op(&mut self, v: u64, kind: OpKind, src: String, now: Instant) {
        self.cached_ops.insert(v, CachedOp { kind, src, at: now });
    }

    pub(crate) fn clear_cached_ops(&mut self) {
        self.cached_ops.clear();
    }

    /// Records a peer's presence message. Returns a change when it cleared
    /// an exposed entry.
    pub(crate) fn receive(&mut self, message: PresenceMessage, now: Instant) -> Option<PresenceChange> {
        let src = message.src.clone()?;
        if self.last_seq.get(&src).is_some_and(|&last| message.seq <= last) {
            log::trace!("Ignoring stale presence {} from {src}", message.seq);
            return None;
        }
        self.last_seq.insert(src.clone(), message.seq);

        if message.p.is_null() {
            self.received.remove(&src);
            return self.remote.remove(&src).map(|_| (src, None));
        }
        if message.v.is_none() {
            return None;
        }
        self.received.insert(src, Received { message, at: now });
        None
    }

    /// Moves every buffered entry the local version has caught up with into
    /// the exposed set.
    pub(crate) fn process_received(
        &mut self,
        version: Option<u64>,
        ty: Option<&Arc<dyn OtType>>,
        local_ops: &[&OpKind],
        now: Instant,
    ) -> Vec<PresenceChange> {
        let Some(version) = version else {
            return Vec::new();
        };
        let ready: Vec<String> = self
            .received
            .iter()
            .filter(|(_, r)| r.message.v.is_some_and(|v| v <= version))
            .map(|(src, _)| src.clone())
            .collect();

        let mut changes = Vec::new();
        for src in ready {
            let Some(received) = self.received.remove(&src) else {
                continue;
            };
            match self.carry_forward(&src, received.message, version, ty, local_ops) {
                Some(value) => {
                    self.remote.insert(src.clone(), RemotePresence { value: value.clone(), at: now });
                    changes.push((src, Some(value)));
                }
                None => {
                    log::debug!("Dropped presence from {src}: cannot transform to v{version}");
                    if self.remote.remove(&src).is_some() {
                        changes.push((src, None));
                    }
                }
            }
        }
        changes
    }

    fn carry_forward(
        &self,
        src: &str,
        message: PresenceMessage,
        version: u64,
        ty: Option<&Arc<dyn OtType>>,
        local_ops: &[&OpKind],
    ) -> Option<Value> {
        let ty = ty.filter(|ty| ty.supports_presence())?;
        let mut value = message.p;
        for v in message.v?..version {
            let cached = self.cached_ops.get(&v)?;
            match &cached.kind {
                OpKind::Edit(op) => value = ty.transform_presence(&value, op, cached.src == src).ok()?,
                OpKind::Noop => {}
                OpKind::Create(_) | OpKind::Del => return None,
            }
        }
        for kind in local_ops {
            match kind {
                OpKind::Edit(op) => value = ty.transform_presence(&value, op, false).ok()?,
                OpKind::Noop => {}
                OpKind::Create(_) | OpKind::Del => return None,
            }
        }
        Some(value)
    }

    /// Moves exposed entries and the local presence past an op that was just
    /// applied to local data.
    pub(crate) fn transform(
        &mut self,
        kind: &OpKind,
        author: Author<'_>,
        ty: Option<&Arc<dyn OtType>>,
    ) -> Vec<PresenceChange> {
        let op = match kind {
            OpKind::Noop => return Vec::new(),
            OpKind::Create(_) | OpKind::Del => {
                self.local = None;
                return self.clear_remote();
            }
            OpKind::Edit(op) => op,
        };
        let Some(ty) = ty.filter(|ty| ty.supports_presence()) else {
            return Vec::new();
        };

        let mut dropped = Vec::new();
        for (src, entry) in self.remote.iter_mut() {
            let own = matches!(author, Author::Remote(author) if src.as_str() == author);
            match ty.transform_presence(&entry.value, op, own) {
                Ok(value) => entry.value = value,
                Err(_) => dropped.push(src.clone()),
            }
        }
        for src in &dropped {
            self.remote.remove(src);
        }

        if let Some(local) = &self.local {
            let own = matches!(author, Author::Local);
            self.local = ty.transform_presence(local, op, own).ok();
        }
        dropped.into_iter().map(|src| (src, None)).collect()
    }

    /// Forgets every peer, e.g. when the transport went away.
    pub(crate) fn clear_remote(&mut self) -> Vec<PresenceChange> {
        self.received.clear();
        self.last_seq.clear();
        self.remote.drain().map(|(src, _)| (src, None)).collect()
    }

    /// Drops what aged out. Returns the exposed entries that went away.
    pub(crate) fn sweep(&mut self, now: Instant, config: &DocConfig) -> Vec<PresenceChange> {
        self.cached_ops
            .retain(|_, op| now.duration_since(op.at) < config.cached_ops_timeout);
        self.received
            .retain(|_, r| now.duration_since(r.at) < config.received_presence_timeout);

        let expired: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, p)| now.duration_since(p.at) >= config.received_presence_timeout)
            .map(|(src, _)| src.clone())
            .collect();
        for src in &expired {
            self.remote.remove(src);
        }
        let (received, remote) = (&self.received, &self.remote);
        self.last_seq
            .retain(|src, _| received.contains_key(src) || remote.contains_key(src));
        expired.into_iter().map(|src| (src, None)).collect()
    }

    pub(crate) fn remote(&self) -> HashMap<String, Value> {
        self.remote
            .iter()
            .map(|(src, p)| (src.clone(), p.value.clone()))
            .collect()
    }

    pub(crate) fn wait(&mut self, reply: PresenceReply) {
        self.waiting.push(reply);
    }

    /// Seq for the next outgoing message; replies waiting for a send are
    /// attached to it.
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.local_seq += 1;
        let seq = self.local_seq;
        self.acks.extend(self.waiting.drain(..).map(|reply| (seq, reply)));
        seq
    }

    pub(crate) fn ack(&mut self, seq: u64, result: Result<(), SyncError>) {
        let (done, rest): (Vec<_>, Vec<_>) = self.acks.drain(..).partition(|(s, _)| *s <= seq);
        self.acks = rest;
        for (_, reply) in done {
            let _ = reply.send(result.clone());
        }
    }

    /// Fails every reply still waiting.
    pub(crate) fn fail_all(&mut self, err: SyncError) {
        for (_, reply) in self.acks.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
        for reply in self.waiting.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

//! The authority's write path.
//!
//! ```text
//! check ─► submit mw ─┬─► load snapshot ─► transform past missed ops
//!                     │        ─► apply mw ─► apply ─► commit mw ─► CAS commit
//!                     │                                               │
//!                     └────────────── conflict, retry ◄───────────────┘
//!                                                                     │ ok
//!                                             publish ◄── after-submit mw
//! ```

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::SyncError;
use crate::middleware::{Action, Request};
use crate::op::{self, now_millis, Op, OpKind, Snapshot};
use crate::projection::Projection;
use crate::protocol::{Message, OpMessage};
use crate::pubsub::{collection_channel, doc_channel};

/// An op as received from a session, before the authority assigned it a
/// version.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub src: String,
    pub seq: u64,
    /// Version the op was issued against. `None` is only meaningful for a
    /// create, or for an edit that should apply to whatever is current.
    pub v: Option<u64>,
    pub kind: OpKind,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// The committed op, at the version it was committed from.
    pub op: Op,
    /// Ops committed by others that the submission was transformed past,
    /// in version order.
    pub ops: Vec<Op>,
    /// Snapshot after the commit. For a duplicate, the current snapshot.
    pub snapshot: Snapshot,
    /// The op had already been committed by an earlier attempt.
    pub duplicate: bool,
}

pub(crate) struct SubmitRequest<'a> {
    backend: &'a Backend,
    agent: Option<&'a str>,
    collection: &'a str,
    id: &'a str,
    submission: Submission,
    /// Set when the op was submitted through a projection of `collection`.
    projection: Option<Arc<Projection>>,
    retries: u32,
}

impl<'a> SubmitRequest<'a> {
    pub(crate) fn new(
        backend: &'a Backend,
        agent: Option<&'a str>,
        collection: &'a str,
        id: &'a str,
        submission: Submission,
    ) -> Self {
        Self {
            backend,
            agent,
            collection,
            id,
            submission,
            projection: None,
            retries: 0,
        }
    }

    pub(crate) fn projection(mut self, projection: Option<Arc<Projection>>) -> Self {
        self.projection = projection;
        self
    }

    pub(crate) async fn run(mut self) -> Result<SubmitOutcome, SyncError> {
        op::check_op(&self.submission.kind, self.backend.types())?;

        let mut request = self.request(Action::Submit);
        request.op = Some(self.pending_op(self.submission.v.unwrap_or_default()));
        self.backend.middleware().trigger(&mut request)?;
        if let Some(op) = request.op {
            self.submission.kind = op.kind;
        }

        let mut missed: Vec<Op> = Vec::new();
        loop {
            let snapshot = self.backend.store().get_snapshot(self.collection, self.id).await?;
            if let Some(projection) = &self.projection {
                projection.check_op(snapshot.type_uri.as_deref(), &self.submission.kind)?;
            }

            let v = match self.submission.v {
                Some(v) => v,
                None if matches!(self.submission.kind, OpKind::Create(_)) && snapshot.exists() => {
                    if let Some(mut outcome) = self.find_committed(0, &snapshot, &missed).await? {
                        // The creator adopts the ack version directly.
                        outcome.ops.clear();
                        return Ok(outcome);
                    }
                    return Err(SyncError::AlreadyExists(format!("{}.{}", self.collection, self.id)));
                }
                None => snapshot.v,
            };
            if v > snapshot.v {
                return Err(SyncError::VersionMismatch(format!(
                    "Op at version {v} is ahead of {}.{} at version {}",
                    self.collection, self.id, snapshot.v
                )));
            }

            let mut op = self.pending_op(v);
            if v < snapshot.v {
                if let Some(outcome) = self.find_committed(v, &snapshot, &missed).await? {
                    return Ok(outcome);
                }
                let ops = self.backend.get_ops_raw(self.collection, self.id, v, Some(snapshot.v)).await?;
                self.transform(&mut op, &snapshot, &ops)?;
                missed.extend(ops);
            }

            let mut request = self.request(Action::Apply);
            request.op = Some(op);
            request.snapshot = Some(snapshot);
            self.backend.middleware().trigger(&mut request)?;
            let (mut op, mut snapshot) = take_op_and_snapshot(request)?;

            op::apply(self.backend.types(), &mut snapshot, &op)?;
            op.ts = now_millis();

            let mut request = self.request(Action::Commit);
            request.op = Some(op);
            request.snapshot = Some(snapshot);
            self.backend.middleware().trigger(&mut request)?;
            let (op, snapshot) = take_op_and_snapshot(request)?;

            if self.backend.store().commit(self.collection, self.id, &op, &snapshot).await? {
                log::debug!(
                    "Committed {}.{} v{} from {} (seq {})",
                    self.collection,
                    self.id,
                    op.v,
                    op.src,
                    op.seq
                );
                self.after_commit(&op, &snapshot);
                return Ok(SubmitOutcome {
                    op,
                    ops: missed,
                    snapshot,
                    duplicate: false,
                });
            }

            // Someone else committed at this version; catch up and retry.
            self.retries += 1;
            if let Some(max) = self.backend.config().max_submit_retries {
                if self.retries > max {
                    log::warn!(
                        "Giving up on {}.{} from {} after {max} retries",
                        self.collection,
                        self.id,
                        self.submission.src
                    );
                    return Err(SyncError::MaxRetriesExceeded(format!(
                        "{}.{}",
                        self.collection, self.id
                    )));
                }
            }
            log::warn!(
                "Version conflict on {}.{} at v{}, retry {}",
                self.collection,
                self.id,
                op.v,
                self.retries
            );
            self.submission.v = Some(op.v);
            self.submission.kind = op.kind;
        }
    }

    fn request(&self, action: Action) -> Request {
        Request::new(action, self.collection)
            .agent(self.agent)
            .doc(self.id)
    }

    fn pending_op(&self, v: u64) -> Op {
        Op {
            src: self.submission.src.clone(),
            seq: self.submission.seq,
            v,
            kind: self.submission.kind.clone(),
            ts: 0,
        }
    }

    /// Looks for this `(src, seq)` among the ops committed since `from`.
    async fn find_committed(
        &self,
        from: u64,
        snapshot: &Snapshot,
        missed: &[Op],
    ) -> Result<Option<SubmitOutcome>, SyncError> {
        let ops = self
            .backend
            .get_ops_raw(self.collection, self.id, from, Some(snapshot.v))
            .await?;
        let src = &self.submission.src;
        let seq = self.submission.seq;
        let Some(position) = ops.iter().position(|op| op.is_from(src, seq)) else {
            return Ok(None);
        };
        log::debug!(
            "Op {src}/{seq} already committed to {}.{} at v{}",
            self.collection,
            self.id,
            ops[position].v
        );
        let mut ops = ops;
        let committed = ops.remove(position);
        ops.truncate(position);
        let mut before = missed.to_vec();
        before.extend(ops);
        Ok(Some(SubmitOutcome {
            op: committed,
            ops: before,
            snapshot: snapshot.clone(),
            duplicate: true,
        }))
    }

    fn transform(&self, op: &mut Op, snapshot: &Snapshot, ops: &[Op]) -> Result<(), SyncError> {
        let type_uri = snapshot.type_uri.as_deref().or_else(|| {
            ops.iter().rev().find_map(|o| match &o.kind {
                OpKind::Create(create) => Some(create.type_uri.as_str()),
                _ => None,
            })
        });
        for applied in ops {
            op::transform(self.backend.types(), type_uri, op, applied)?;
        }
        Ok(())
    }

    fn after_commit(&self, op: &Op, snapshot: &Snapshot) {
        let mut request = self.request(Action::AfterSubmit);
        request.op = Some(op.clone());
        request.snapshot = Some(snapshot.clone());
        if let Err(e) = self.backend.middleware().trigger(&mut request) {
            log::warn!("After-submit middleware failed for {}.{}: {e}", self.collection, self.id);
        }

        if self.backend.config().suppress_publish {
            return;
        }
        let message = Arc::new(Message::Op(OpMessage::from_op(self.collection, self.id, op)));
        let channels = [collection_channel(self.collection), doc_channel(self.collection, self.id)];
        let reached = self.backend.pubsub().publish(&channels, message);
        log::trace!("Published {}.{} v{} to {reached} receivers", self.collection, self.id, op.v);
    }
}

fn take_op_and_snapshot(request: Request) -> Result<(Op, Snapshot), SyncError> {
    match (request.op, request.snapshot) {
        (Some(op), Some(snapshot)) => Ok((op, snapshot)),
        _ => Err(SyncError::Rejected(format!(
            "Middleware removed the op or snapshot during {:?}",
            request.action
        ))),
    }
}

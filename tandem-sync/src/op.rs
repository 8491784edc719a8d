//! Snapshots, operation records, and the authority's apply / transform
//! rules for them.
//!
//! An operation is one of `create`, `del` or a type-specific edit. On the
//! wire and in storage the kind is flattened into the surrounding object:
//!
//! ```text
//! {"src": "...", "seq": 3, "v": 7, "create": {"type": "...", "data": {...}}}
//! {"src": "...", "seq": 4, "v": 8, "op": [{"p": ["color"], "oi": "gray"}]}
//! {"src": "...", "seq": 5, "v": 9, "del": true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_ot::{Side, TypeRegistry};

use crate::error::SyncError;

/// Materialized document state.
///
/// `type_uri == None` means the document does not exist; `v` still counts
/// every op committed to it, including creates and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: u64,
    #[serde(rename = "type", default)]
    pub type_uri: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Snapshot {
    /// A never-created document at version 0.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            v: 0,
            type_uri: None,
            data: Value::Null,
        }
    }

    pub fn exists(&self) -> bool {
        self.type_uri.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOp {
    #[serde(rename = "type")]
    pub type_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OpKindRepr", into = "OpKindRepr")]
pub enum OpKind {
    Create(CreateOp),
    Del,
    Edit(Value),
    /// Carries no change but still takes a version slot.
    Noop,
}

impl OpKind {
    pub fn is_edit(&self) -> bool {
        matches!(self, OpKind::Edit(_))
    }

    pub fn edit(&self) -> Option<&Value> {
        match self {
            OpKind::Edit(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct OpKindRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create: Option<CreateOp>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    del: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<Value>,
}

impl From<OpKindRepr> for OpKind {
    fn from(repr: OpKindRepr) -> Self {
        match repr {
            OpKindRepr { create: Some(create), .. } => OpKind::Create(create),
            OpKindRepr { del: true, .. } => OpKind::Del,
            OpKindRepr { op: Some(op), .. } => OpKind::Edit(op),
            _ => OpKind::Noop,
        }
    }
}

impl From<OpKind> for OpKindRepr {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Create(create) => OpKindRepr {
                create: Some(create),
                ..Default::default()
            },
            OpKind::Del => OpKindRepr {
                del: true,
                ..Default::default()
            },
            OpKind::Edit(op) => OpKindRepr {
                op: Some(op),
                ..Default::default()
            },
            OpKind::Noop => OpKindRepr::default(),
        }
    }
}

/// A committed (or about to be committed) operation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub src: String,
    pub seq: u64,
    /// The version this op applies *from*.
    pub v: u64,
    #[serde(flatten)]
    pub kind: OpKind,
    /// Commit time, milliseconds since the epoch.
    #[serde(default)]
    pub ts: u64,
}

impl Op {
    pub fn is_from(&self, src: &str, seq: u64) -> bool {
        self.src == src && self.seq == seq
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Structural checks that do not need the current snapshot.
pub fn check_op(kind: &OpKind, types: &TypeRegistry) -> Result<(), SyncError> {
    match kind {
        OpKind::Create(create) => {
            types
                .get(&create.type_uri)
                .ok_or_else(|| SyncError::UnknownType(create.type_uri.clone()))?;
        }
        OpKind::Edit(op) if !(op.is_array() || op.is_object()) => {
            return Err(SyncError::InvalidOperation(format!(
                "Op must be an array or object: {op}"
            )));
        }
        _ => {}
    }
    Ok(())
}

/// Applies `op` to `snapshot` in place, advancing its version.
pub fn apply(types: &TypeRegistry, snapshot: &mut Snapshot, op: &Op) -> Result<(), SyncError> {
    if op.v != snapshot.v {
        return Err(SyncError::VersionMismatch(format!(
            "Op version {} does not match snapshot version {}",
            op.v, snapshot.v
        )));
    }
    match &op.kind {
        OpKind::Create(create) => {
            if snapshot.exists() {
                return Err(SyncError::AlreadyExists(snapshot.id.clone()));
            }
            let ty = types.require(&create.type_uri)?;
            snapshot.data = ty.create(create.data.clone())?;
            snapshot.type_uri = Some(ty.uri().to_string());
        }
        OpKind::Del => {
            snapshot.data = Value::Null;
            snapshot.type_uri = None;
        }
        OpKind::Edit(edit) => {
            let uri = snapshot
                .type_uri
                .as_deref()
                .ok_or_else(|| SyncError::NotFound(snapshot.id.clone()))?;
            let ty = types.require(uri)?;
            snapshot.data = ty.apply(&snapshot.data, edit)?;
        }
        OpKind::Noop => {}
    }
    snapshot.v += 1;
    Ok(())
}

/// Rewrites `op` so it applies after the already committed `applied`.
/// `type_uri` is the document type at the time of the transform.
pub fn transform(
    types: &TypeRegistry,
    type_uri: Option<&str>,
    op: &mut Op,
    applied: &Op,
) -> Result<(), SyncError> {
    if op.v != applied.v {
        return Err(SyncError::VersionMismatch(format!(
            "Cannot transform op at version {} against op at version {}",
            op.v, applied.v
        )));
    }
    match (&applied.kind, &mut op.kind) {
        (OpKind::Del, OpKind::Create(_) | OpKind::Edit(_)) => return Err(SyncError::DeletedRemotely),
        (OpKind::Create(_), OpKind::Edit(_) | OpKind::Create(_) | OpKind::Del)
        | (OpKind::Edit(_), OpKind::Create(_)) => return Err(SyncError::CreatedRemotely),
        (OpKind::Edit(applied_edit), OpKind::Edit(edit)) => {
            let uri = type_uri.ok_or_else(|| SyncError::NotFound(applied.src.clone()))?;
            let ty = types.require(uri)?;
            *edit = ty.transform(edit, applied_edit, Side::Left)?;
        }
        _ => {}
    }
    op.v += 1;
    Ok(())
}

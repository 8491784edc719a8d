//! Storage adapter for snapshots and op logs.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  get_snapshot / get_ops   ┌──────────────────────────┐
//! │  Backend    │ ────────────────────────► │ Store                    │
//! │  (submit)   │                           │  MemoryStore (default)   │
//! │             │  commit(op, snapshot)     │  RocksStore (persistence)│
//! └─────────────┘ ────────────────────────► └──────────────────────────┘
//!                   compare-and-swap on v
//! ```
//!
//! Ops are append-only and addressed by the version they apply from;
//! snapshots are latest-wins. `commit` is the only write and must be
//! atomic: it succeeds only when the stored version equals `op.v`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;
use crate::op::{Op, Snapshot};

pub mod memory;
#[cfg(feature = "persistence")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "persistence")]
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend database error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Ops requested past the end of the log
    MissingOps { from: u64, to: u64 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::MissingOps { from, to } => write!(f, "Missing ops from {from} to {to}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Current snapshot; a never-created document is returned as
    /// [`Snapshot::empty`], not as an error.
    async fn get_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, StoreError>;

    async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Snapshot>, StoreError> {
        let mut snapshots = HashMap::with_capacity(ids.len());
        for id in ids {
            snapshots.insert(id.clone(), self.get_snapshot(collection, id).await?);
        }
        Ok(snapshots)
    }

    /// Ops with `from <= v < to`; `to == None` reads to the end of the log.
    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, StoreError>;

    /// Ops since each given version, keyed by document id.
    async fn get_ops_bulk(
        &self,
        collection: &str,
        from: &HashMap<String, u64>,
    ) -> Result<HashMap<String, Vec<Op>>, StoreError> {
        let mut ops = HashMap::with_capacity(from.len());
        for (id, v) in from {
            ops.insert(id.clone(), self.get_ops(collection, id, *v, None).await?);
        }
        Ok(ops)
    }

    /// Appends `op` and replaces the snapshot with `snapshot`, but only if
    /// the stored version still equals `op.v`. Returns `false` on a version
    /// conflict, leaving storage untouched.
    async fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, StoreError>;

    /// Existing documents in `collection` matching `query`, ordered by id.
    async fn query(&self, collection: &str, query: &Value) -> Result<Vec<Snapshot>, StoreError>;
}

/// Field-equality matcher shared by the bundled stores.
///
/// Every non-`$` key of `query` must equal the value at that (dotted) path
/// of the snapshot data. `$limit` caps the result count.
pub fn matches_query(snapshot: &Snapshot, query: &Value) -> bool {
    if !snapshot.exists() {
        return false;
    }
    let Some(conditions) = query.as_object() else {
        return query.is_null();
    };
    conditions
        .iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .all(|(path, expected)| {
            let found = path
                .split('.')
                .try_fold(&snapshot.data, |value, key| value.get(key));
            found == Some(expected)
        })
}

pub(crate) fn query_limit(query: &Value) -> Option<usize> {
    query.get("$limit").and_then(Value::as_u64).map(|n| n as usize)
}

/// Sorts by id and applies `$limit`.
pub(crate) fn finish_query(mut results: Vec<Snapshot>, query: &Value) -> Vec<Snapshot> {
    results.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(limit) = query_limit(query) {
        results.truncate(limit);
    }
    results
}

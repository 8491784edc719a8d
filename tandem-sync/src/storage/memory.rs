//! In-process store. Everything is lost when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{finish_query, matches_query, Store, StoreError};
use crate::op::{Op, Snapshot};

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<Snapshot>,
    /// `ops[n].v == n`
    ops: Vec<Op>,
}

/// Store keyed by `(collection, id)` behind a single async lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents that have at least one committed op.
    pub async fn len(&self) -> usize {
        self.docs.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_snapshot(&self, collection: &str, id: &str) -> Result<Snapshot, StoreError> {
        let docs = self.docs.read().await;
        let snapshot = docs
            .get(collection)
            .and_then(|c| c.get(id))
            .and_then(|entry| entry.snapshot.clone())
            .unwrap_or_else(|| Snapshot::empty(id));
        Ok(snapshot)
    }

    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, StoreError> {
        let docs = self.docs.read().await;
        let Some(entry) = docs.get(collection).and_then(|c| c.get(id)) else {
            return Ok(Vec::new());
        };
        let len = entry.ops.len() as u64;
        let to = to.unwrap_or(len);
        if to > len {
            return Err(StoreError::MissingOps { from: len, to });
        }
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(entry.ops[from as usize..to as usize].to_vec())
    }

    async fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        let entry = docs
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        if op.v != entry.ops.len() as u64 || snapshot.v != op.v + 1 {
            return Ok(false);
        }
        entry.ops.push(op.clone());
        entry.snapshot = Some(snapshot.clone());
        Ok(true)
    }

    async fn query(&self, collection: &str, query: &Value) -> Result<Vec<Snapshot>, StoreError> {
        let docs = self.docs.read().await;
        let results = docs
            .get(collection)
            .into_iter()
            .flat_map(HashMap::values)
            .filter_map(|entry| entry.snapshot.as_ref())
            .filter(|snapshot| matches_query(snapshot, query))
            .cloned()
            .collect();
        Ok(finish_query(results, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{CreateOp, OpKind};
    use serde_json::json;

    fn create_op() -> Op {
        Op {
            src: "a".into(),
            seq: 1,
            v: 0,
            kind: OpKind::Create(CreateOp {
                type_uri: "http://sharejs.org/types/JSONv0".into(),
                data: Some(json!({})),
            }),
            ts: 0,
        }
    }

    fn created(id: &str, data: Value) -> Snapshot {
        Snapshot {
            id: id.into(),
            v: 1,
            type_uri: Some("http://sharejs.org/types/JSONv0".into()),
            data,
        }
    }

    #[tokio::test]
    async fn test_missing_document_is_empty_snapshot() {
        let store = MemoryStore::new();
        let snapshot = store.get_snapshot("dogs", "fido").await.unwrap();
        assert_eq!(snapshot, Snapshot::empty("fido"));
        assert!(store.get_ops("dogs", "fido", 0, None).await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_commit_is_compare_and_swap() {
        let store = MemoryStore::new();
        let op = create_op();
        assert!(store.commit("dogs", "fido", &op, &created("fido", json!({}))).await.unwrap());
        // Same base version again: conflict, nothing written.
        assert!(!store.commit("dogs", "fido", &op, &created("fido", json!({ "x": 1 }))).await.unwrap());

        let snapshot = store.get_snapshot("dogs", "fido").await.unwrap();
        assert_eq!(snapshot.data, json!({}));
        assert_eq!(store.get_ops("dogs", "fido", 0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_ops_past_end() {
        let store = MemoryStore::new();
        store.commit("dogs", "fido", &create_op(), &created("fido", json!({}))).await.unwrap();
        assert_eq!(
            store.get_ops("dogs", "fido", 0, Some(3)).await,
            Err(StoreError::MissingOps { from: 1, to: 3 })
        );
    }

    #[tokio::test]
    async fn test_query_collection() {
        let store = MemoryStore::new();
        store.commit("dogs", "fido", &create_op(), &created("fido", json!({ "color": "white" }))).await.unwrap();
        store.commit("dogs", "spot", &create_op(), &created("spot", json!({ "color": "gray" }))).await.unwrap();
        store.commit("cats", "tom", &create_op(), &created("tom", json!({ "color": "white" }))).await.unwrap();

        let white = store.query("dogs", &json!({ "color": "white" })).await.unwrap();
        assert_eq!(white.len(), 1);
        assert_eq!(white[0].id, "fido");
        assert_eq!(store.query("dogs", &json!({})).await.unwrap().len(), 2);
    }
}

//! Live query results on the client.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::protocol::{Message, QueryMessage};

use super::connection::Shared;
use super::doc::Doc;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// The result set was replaced; read it with [`Query::results`].
    Changed,
    Error(SyncError),
}

pub(crate) struct QueryState {
    pub(crate) id: u64,
    pub(crate) collection: String,
    pub(crate) query: Value,
    results: Mutex<Vec<Doc>>,
    events: broadcast::Sender<QueryEvent>,
}

impl QueryState {
    pub(crate) fn new(id: u64, collection: &str, query: Value) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id,
            collection: collection.to_string(),
            query,
            results: Mutex::new(Vec::new()),
            events,
        }
    }

    pub(crate) fn set_results(&self, docs: Vec<Doc>) {
        *self.results.lock() = docs;
    }

    pub(crate) fn emit(&self, event: QueryEvent) {
        let _ = self.events.send(event);
    }
}

/// A subscribed query. Results are document handles of the same
/// connection, so they also receive the documents' own updates.
pub struct Query {
    state: Arc<QueryState>,
    shared: Weak<Shared>,
}

impl Query {
    pub(crate) fn new(state: Arc<QueryState>, shared: Weak<Shared>) -> Self {
        Self { state, shared }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn collection(&self) -> &str {
        &self.state.collection
    }

    pub fn results(&self) -> Vec<Doc> {
        self.state.results.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state
            .results
            .lock()
            .iter()
            .map(|doc| doc.id().to_string())
            .collect()
    }

    pub fn events(&self) -> broadcast::Receiver<QueryEvent> {
        self.state.events.subscribe()
    }

    /// Stops live updates.
    pub fn destroy(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.forget_query(self.state.id);
        if shared.link().can_send() {
            shared.link().send(Message::QueryUnsubscribe(QueryMessage {
                id: self.state.id,
                c: self.state.collection.clone(),
                q: Value::Null,
                results: None,
                error: None,
            }));
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.state.id)
            .field("collection", &self.state.collection)
            .field("query", &self.state.query)
            .finish()
    }
}

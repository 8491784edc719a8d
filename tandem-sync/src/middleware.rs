//! Named extension points of the authority.
//!
//! Handlers for an action run in registration order; the first error stops
//! the chain and fails the action. Handlers may rewrite the request (for
//! instance strip fields from `snapshots` in `ReadSnapshots`).
//!
//! | Action          | When                                          | Retried |
//! |-----------------|-----------------------------------------------|---------|
//! | `Connect`       | before the handshake of a new session         | no      |
//! | `Receive`       | every inbound message of a session            | no      |
//! | `Submit`        | once per submission, before loading state     | no      |
//! | `Apply`         | before applying to the snapshot               | per try |
//! | `Commit`        | after applying, before the storage write      | per try |
//! | `AfterSubmit`   | after a successful commit                     | no      |
//! | `Op`            | each op sent to a session                     | no      |
//! | `Query`         | before a query runs                           | no      |
//! | `ReadSnapshots` | snapshots leaving the authority               | no      |

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::SyncError;
use crate::op::{Op, Snapshot};
use crate::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Connect,
    Receive,
    Submit,
    Apply,
    Commit,
    AfterSubmit,
    Op,
    Query,
    ReadSnapshots,
}

/// Context handed to middleware. Fields not relevant to the action are
/// left empty.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: Action,
    /// Session id, `None` for server-side calls.
    pub agent: Option<String>,
    pub collection: String,
    pub id: Option<String>,
    pub op: Option<Op>,
    pub snapshot: Option<Snapshot>,
    pub snapshots: Vec<Snapshot>,
    pub query: Option<Value>,
    pub message: Option<Message>,
}

impl Request {
    pub fn new(action: Action, collection: impl Into<String>) -> Self {
        Self {
            action,
            agent: None,
            collection: collection.into(),
            id: None,
            op: None,
            snapshot: None,
            snapshots: Vec::new(),
            query: None,
            message: None,
        }
    }

    pub fn agent(mut self, agent: Option<&str>) -> Self {
        self.agent = agent.map(str::to_string);
        self
    }

    pub fn doc(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }
}

pub type Handler = Arc<dyn Fn(&mut Request) -> Result<(), SyncError> + Send + Sync>;

#[derive(Default)]
pub struct Middleware {
    handlers: RwLock<HashMap<Action, Vec<Handler>>>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, action: Action, handler: F)
    where
        F: Fn(&mut Request) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(action)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn has(&self, action: Action) -> bool {
        self.handlers.read().get(&action).is_some_and(|h| !h.is_empty())
    }

    /// Runs the chain for `request.action`.
    pub fn trigger(&self, request: &mut Request) -> Result<(), SyncError> {
        // Clone the list so handlers may register more handlers.
        let handlers = match self.handlers.read().get(&request.action) {
            Some(handlers) => handlers.clone(),
            None => return Ok(()),
        };
        for handler in handlers {
            handler(request)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<_, _> = handlers.iter().map(|(a, h)| (*a, h.len())).collect();
        f.debug_struct("Middleware").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_run_in_order() {
        let middleware = Middleware::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let calls = Arc::clone(&calls);
            middleware.add(Action::Submit, move |_| {
                calls.lock().unwrap().push(n);
                Ok(())
            });
        }
        let mut request = Request::new(Action::Submit, "dogs");
        middleware.trigger(&mut request).unwrap();
        assert_eq!(*calls.lock().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn test_error_short_circuits() {
        let middleware = Middleware::new();
        let reached = Arc::new(Mutex::new(false));
        middleware.add(Action::Commit, |_| Err(SyncError::Rejected("read only".into())));
        let flag = Arc::clone(&reached);
        middleware.add(Action::Commit, move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        let mut request = Request::new(Action::Commit, "dogs");
        assert_eq!(
            middleware.trigger(&mut request),
            Err(SyncError::Rejected("read only".into()))
        );
        assert!(!*reached.lock().unwrap());
    }

    #[test]
    fn test_handlers_can_rewrite_request() {
        let middleware = Middleware::new();
        middleware.add(Action::ReadSnapshots, |request| {
            for snapshot in &mut request.snapshots {
                if let Some(data) = snapshot.data.as_object_mut() {
                    data.remove("secret");
                }
            }
            Ok(())
        });
        let mut request = Request::new(Action::ReadSnapshots, "dogs");
        request.snapshots.push(Snapshot {
            id: "fido".into(),
            v: 1,
            type_uri: Some("json0".into()),
            data: serde_json::json!({ "secret": 1, "name": "Fido" }),
        });
        middleware.trigger(&mut request).unwrap();
        assert_eq!(request.snapshots[0].data, serde_json::json!({ "name": "Fido" }));
        assert!(!middleware.has(Action::Query));
    }
}

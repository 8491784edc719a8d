//! Client side: a [`Connection`] per session and a [`Doc`] handle per
//! document it touches.
//!
//! - [`connection`] — session lifecycle, message routing, reconnection
//! - [`doc`] — optimistic local edits, acknowledgement and rollback
//! - [`presence`] — peers' cursors, buffered and transformed to local data
//! - [`query`] — live query result sets
//! - `undo` — undo and redo stacks of local edits
//! - [`socket`] — WebSocket transport

pub mod connection;
pub mod doc;
mod presence;
pub mod query;
pub mod socket;
mod undo;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use doc::{Ack, Doc, DocConfig, DocEvent, Source, SubmitOptions};
pub use query::{Query, QueryEvent};
pub use socket::connect_ws;

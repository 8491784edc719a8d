//! # tandem-sync — Operational-transform document sync
//!
//! An authority commits ops against versioned documents and fans them out
//! to subscribed sessions; clients apply their own edits optimistically
//! and transform them against whatever the authority committed first.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    Transport /     ┌─────────────┐
//! │ Connection  │ ◄────────────────► │ Agent       │
//! │ (per user)  │    WebSocket JSON  │ (per session│
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ Doc         │                    │ Backend     │──► Store
//! │ (optimistic)│                    │ (authority) │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                    ┌──────┴──────┐
//!                                    │ PubSub      │
//!                                    │ (fan-out)   │
//!                                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`op`] — ops, snapshots and the apply/transform helpers around types
//! - [`backend`] — the authority: submit, fetch, subscribe, queries
//! - [`submit`] — one op's path from validation to commit
//! - [`pubsub`] — channel fan-out
//! - [`middleware`] — hooks on authority actions
//! - [`projection`] — field-filtered views of a collection
//! - [`storage`] — snapshot and op-log stores
//! - [`server`] — WebSocket front end
//! - [`client`] — connections, document handles, presence, queries

mod agent;
pub mod backend;
pub mod client;
pub mod error;
pub mod middleware;
pub mod op;
pub mod projection;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod storage;
pub mod submit;
pub mod transport;

pub use tandem_ot;

pub use backend::{Backend, BackendConfig};
pub use client::{
    Ack, Connection, ConnectionConfig, ConnectionState, Doc, DocConfig, DocEvent, Query, QueryEvent, Source,
    SubmitOptions,
};
pub use error::SyncError;
pub use middleware::{Action, Request};
pub use op::{Op, OpKind, Snapshot};
pub use projection::Projection;
pub use protocol::Message;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{MemoryStore, Store, StoreError};
pub use transport::Transport;

//! # tandem-ot — Operational transform algebra
//!
//! Pure functions over edit languages. Every document type implements
//! [`OtType`]; the sync layer only ever talks to types through that trait
//! and an explicit [`TypeRegistry`] handed to it at construction.
//!
//! ## Contract
//!
//! ```text
//!            apply(S, a)                transform(b, a, Right)
//!   S ──────────────────────► S·a ──────────────────────────────► S·a·b'
//!   │                                                              ║
//!   │ apply(S, b)                transform(a, b, Left)             ║
//!   └─────────────────────► S·b ──────────────────────────────► S·b·a'
//! ```
//!
//! Both paths must land on the same value (convergence), and
//! `apply(S, compose(a, b)) == apply(apply(S, a), b)`.
//!
//! ## Modules
//!
//! - [`json0`] — JSON documents: object, list, number and string edits
//! - [`text`] — Plain text: retain / insert / delete, with cursor presence
//! - [`registry`] — Name/URI lookup of registered types

pub mod json0;
pub mod registry;
pub mod text;

use serde_json::Value;
use thiserror::Error;

pub use json0::Json0;
pub use registry::TypeRegistry;
pub use text::Text;

/// Tie-break for concurrent edits at the same position.
///
/// The op being transformed as `Left` wins ties; the authority always
/// transforms incoming submissions as `Left` against committed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OtError {
    /// The op is not well formed for its type.
    #[error("Invalid op: {0}")]
    InvalidOp(String),
    /// The op is well formed but does not fit the value it was applied to.
    #[error("Cannot apply op: {0}")]
    Apply(String),
    #[error("Transform failed: {0}")]
    Transform(String),
    #[error("Invalid presence: {0}")]
    InvalidPresence(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Type {uri} does not support {capability}")]
    Unsupported { uri: String, capability: &'static str },
}

/// An OT document type.
///
/// Ops, snapshots and presence travel as JSON values; implementations parse
/// them into their own typed components, operate, and serialize back.
/// Optional capabilities are advertised by the `can_*` / `supports_*`
/// methods, and the matching operation returns [`OtError::Unsupported`]
/// when the capability is absent.
pub trait OtType: Send + Sync {
    /// Short registry name, e.g. `json0`.
    fn name(&self) -> &'static str;

    /// Canonical URI stored in snapshots.
    fn uri(&self) -> &'static str;

    /// Builds the initial snapshot value from the data passed to `create`.
    fn create(&self, initial: Option<Value>) -> Result<Value, OtError>;

    /// Validates an op and returns it in canonical form.
    fn normalize(&self, op: Value) -> Result<Value, OtError> {
        Ok(op)
    }

    fn apply(&self, data: &Value, op: &Value) -> Result<Value, OtError>;

    /// Rewrites `op` so it applies after `other`, both having been issued
    /// against the same version.
    fn transform(&self, op: &Value, other: &Value, side: Side) -> Result<Value, OtError>;

    fn can_compose(&self) -> bool {
        false
    }

    fn compose(&self, _first: &Value, _second: &Value) -> Result<Value, OtError> {
        Err(self.unsupported("compose"))
    }

    fn can_invert(&self) -> bool {
        false
    }

    fn invert(&self, _op: &Value) -> Result<Value, OtError> {
        Err(self.unsupported("invert"))
    }

    /// Applies `op` to `data` and returns the result with the op that
    /// undoes it. Types whose ops leave out what was removed override this
    /// to recover it from `data`.
    fn apply_and_invert(&self, data: &Value, op: &Value) -> Result<(Value, Value), OtError> {
        let inverse = self.invert(op)?;
        Ok((self.apply(data, op)?, inverse))
    }

    fn can_diff(&self) -> bool {
        false
    }

    /// Produces an op turning `old` into `new`.
    fn diff(&self, _old: &Value, _new: &Value) -> Result<Value, OtError> {
        Err(self.unsupported("diff"))
    }

    fn supports_presence(&self) -> bool {
        false
    }

    /// Validates and canonicalizes a presence payload before it is sent.
    fn create_presence(&self, presence: Value) -> Result<Value, OtError> {
        if self.supports_presence() {
            Ok(presence)
        } else {
            Err(self.unsupported("presence"))
        }
    }

    fn transform_presence(
        &self,
        _presence: &Value,
        _op: &Value,
        _is_own_op: bool,
    ) -> Result<Value, OtError> {
        Err(self.unsupported("presence"))
    }

    fn is_noop(&self, _op: &Value) -> bool {
        false
    }

    fn unsupported(&self, capability: &'static str) -> OtError {
        OtError::Unsupported {
            uri: self.uri().to_string(),
            capability,
        }
    }
}

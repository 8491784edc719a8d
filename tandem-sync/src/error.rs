//! Error taxonomy shared by the authority, sessions and document handles.
//!
//! Every variant maps to a stable numeric code so an error raised by the
//! authority arrives on the client as the same variant.

use serde::{Deserialize, Serialize};
use tandem_ot::OtError;
use thiserror::Error;

/// `{code, message}` as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Maximum submit retries exceeded: {0}")]
    MaxRetriesExceeded(String),
    /// Rejected by middleware. A rejected submit rolls back silently.
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Op already submitted")]
    OpAlreadySubmitted,
    #[error("Document does not exist: {0}")]
    NotFound(String),
    #[error("Document already exists: {0}")]
    AlreadyExists(String),
    #[error("Document was deleted")]
    DeletedRemotely,
    #[error("Document was created remotely")]
    CreatedRemotely,
    #[error("Transform failed: {0}")]
    TransformFailure(String),
    /// The op or snapshot falls outside what a projected collection exposes.
    #[error("Projection: {0}")]
    Projection(String),
    #[error("Version mismatch: {0}")]
    VersionMismatch(String),
    #[error("Not subscribed: {0}")]
    NotSubscribed(String),
    #[error("Cannot submit snapshot: {0}")]
    DiffUnsupported(String),
    #[error("Cannot record undo: {0}")]
    InvertUnsupported(String),
    #[error("Cannot submit presence: {0}")]
    PresenceUnsupported(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection closed")]
    Closed,
    #[error("Version conflict")]
    VersionConflict,
    /// A code this build does not know.
    #[error("Error {code}: {message}")]
    Remote { code: u16, message: String },
}

impl SyncError {
    pub fn code(&self) -> u16 {
        match self {
            SyncError::InvalidMessage(_) => 4000,
            SyncError::MaxRetriesExceeded(_) => 4001,
            SyncError::Rejected(_) => 4002,
            SyncError::InvalidOperation(_) => 4004,
            SyncError::UnknownType(_) => 4008,
            SyncError::OpAlreadySubmitted => 4011,
            SyncError::NotFound(_) => 4015,
            SyncError::AlreadyExists(_) => 4016,
            SyncError::DeletedRemotely => 4017,
            SyncError::CreatedRemotely => 4018,
            SyncError::TransformFailure(_) => 4019,
            SyncError::Projection(_) => 4023,
            SyncError::VersionMismatch(_) => 4024,
            SyncError::NotSubscribed(_) => 4026,
            SyncError::DiffUnsupported(_) => 4027,
            SyncError::InvertUnsupported(_) => 4028,
            SyncError::PresenceUnsupported(_) => 4029,
            SyncError::Storage(_) => 5000,
            SyncError::Channel(_) => 5001,
            SyncError::Transport(_) => 5002,
            SyncError::Closed => 5003,
            SyncError::VersionConflict => 5004,
            SyncError::Remote { code, .. } => *code,
        }
    }

    /// Concurrent edits that cannot be reconciled; the client recovers with
    /// a hard rollback.
    pub fn is_transform_failure(&self) -> bool {
        matches!(
            self,
            SyncError::DeletedRemotely | SyncError::CreatedRemotely | SyncError::TransformFailure(_)
        )
    }

    fn detail(&self) -> String {
        match self {
            SyncError::InvalidMessage(m)
            | SyncError::MaxRetriesExceeded(m)
            | SyncError::Rejected(m)
            | SyncError::InvalidOperation(m)
            | SyncError::UnknownType(m)
            | SyncError::NotFound(m)
            | SyncError::AlreadyExists(m)
            | SyncError::TransformFailure(m)
            | SyncError::Projection(m)
            | SyncError::VersionMismatch(m)
            | SyncError::NotSubscribed(m)
            | SyncError::DiffUnsupported(m)
            | SyncError::InvertUnsupported(m)
            | SyncError::PresenceUnsupported(m)
            | SyncError::Storage(m)
            | SyncError::Channel(m)
            | SyncError::Transport(m)
            | SyncError::Remote { message: m, .. } => m.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.detail(),
        }
    }

    pub fn from_payload(payload: &ErrorPayload) -> Self {
        let m = payload.message.clone();
        match payload.code {
            4000 => SyncError::InvalidMessage(m),
            4001 => SyncError::MaxRetriesExceeded(m),
            4002 => SyncError::Rejected(m),
            4004 => SyncError::InvalidOperation(m),
            4008 => SyncError::UnknownType(m),
            4011 => SyncError::OpAlreadySubmitted,
            4015 => SyncError::NotFound(m),
            4016 => SyncError::AlreadyExists(m),
            4017 => SyncError::DeletedRemotely,
            4018 => SyncError::CreatedRemotely,
            4019 => SyncError::TransformFailure(m),
            4023 => SyncError::Projection(m),
            4024 => SyncError::VersionMismatch(m),
            4026 => SyncError::NotSubscribed(m),
            4027 => SyncError::DiffUnsupported(m),
            4028 => SyncError::InvertUnsupported(m),
            4029 => SyncError::PresenceUnsupported(m),
            5000 => SyncError::Storage(m),
            5001 => SyncError::Channel(m),
            5002 => SyncError::Transport(m),
            5003 => SyncError::Closed,
            5004 => SyncError::VersionConflict,
            code => SyncError::Remote { code, message: m },
        }
    }
}

impl From<OtError> for SyncError {
    fn from(e: OtError) -> Self {
        match e {
            OtError::InvalidOp(m) | OtError::Apply(m) | OtError::InvalidPresence(m) => {
                SyncError::InvalidOperation(m)
            }
            OtError::Transform(m) => SyncError::TransformFailure(m),
            OtError::UnknownType(m) => SyncError::UnknownType(m),
            OtError::Unsupported { uri, capability: "diff" } => SyncError::DiffUnsupported(uri),
            OtError::Unsupported { uri, capability: "invert" } => SyncError::InvertUnsupported(uri),
            OtError::Unsupported { uri, capability: "presence" } => {
                SyncError::PresenceUnsupported(uri)
            }
            OtError::Unsupported { uri, capability } => {
                SyncError::InvalidOperation(format!("Type {uri} does not support {capability}"))
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidMessage(e.to_string())
    }
}

//! Error types for the synchronization core

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    // Protocol errors (connection-fatal)
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    // Request-level errors
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid object space for {class}: expected {expected}, got {actual}")]
    InvalidSpace {
        class: String,
        expected: String,
        actual: String,
    },

    #[error("Class '{0}' not found")]
    ClassNotFound(String),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Document '{0}' already exists")]
    DocumentExists(String),

    #[error("Domain request not supported for '{0}'")]
    UnsupportedDomainRequest(String),

    #[error("Unknown backup chunk: {0}")]
    UnknownChunk(u64),

    // Session / workspace errors
    #[error("Session is not active")]
    SessionNotActive,

    #[error("Workspace '{0}' already exists")]
    WorkspaceExists(String),

    #[error("Workspace '{0}' not found")]
    WorkspaceNotFound(String),

    #[error("Workspace '{0}' has live sessions and cannot be removed")]
    WorkspaceInUse(String),

    #[error("Invalid workspace name: {0}")]
    InvalidWorkspaceName(String),

    // Migration errors
    #[error("Migration step '{step}' failed: {reason}")]
    Migration { step: String, reason: String },

    // Store / infrastructure errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    /// Get status code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::MalformedRequest(_)
            | SyncError::MalformedResponse(_)
            | SyncError::FrameTooLarge(_) => "platform:status:BadRequest",
            SyncError::UnknownMethod(_) => "platform:status:UnknownMethod",
            SyncError::InvalidParams { .. } => "platform:status:BadRequest",
            SyncError::Unauthorized(_) => "platform:status:Unauthorized",
            SyncError::Forbidden(_) => "platform:status:Forbidden",
            SyncError::InvalidSpace { .. } => "platform:status:Forbidden",
            SyncError::ClassNotFound(_) => "platform:status:ClassNotFound",
            SyncError::DocumentNotFound(_) => "platform:status:ObjectNotFound",
            SyncError::DocumentExists(_) => "platform:status:ObjectAlreadyExists",
            SyncError::UnknownChunk(_) => "platform:status:ObjectNotFound",
            SyncError::SessionNotActive => "platform:status:ConnectionClosed",
            SyncError::WorkspaceExists(_) => "platform:status:WorkspaceAlreadyExists",
            SyncError::WorkspaceNotFound(_) => "platform:status:WorkspaceNotFound",
            SyncError::WorkspaceInUse(_) => "platform:status:WorkspaceInUse",
            SyncError::InvalidWorkspaceName(_) => "platform:status:BadRequest",
            _ => "platform:status:UnknownError",
        }
    }

    /// Protocol-level failures close the connection; everything else is
    /// reported per request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedRequest(_) | SyncError::MalformedResponse(_) | SyncError::FrameTooLarge(_)
        )
    }

    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::Forbidden(_) | SyncError::InvalidSpace { .. }
        )
    }

    /// Wire representation of this error
    pub fn status(&self) -> Status {
        let mut params = Map::new();
        params.insert("message".to_string(), Value::String(self.to_string()));
        Status {
            severity: Severity::Error,
            code: self.code().to_string(),
            params,
        }
    }
}

/// Severity of a reported status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
}

/// Error payload carried by `Response.error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub severity: Severity,
    pub code: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Status {
    pub fn message(&self) -> Option<&str> {
        self.params.get("message").and_then(Value::as_str)
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GolemError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Batch already exists: {0}")]
    BatchExists(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Task {batch_id}/{task_id} is already registered")]
    AlreadyRegistered { batch_id: String, task_id: u64 },

    #[error("Executable not found: {name}: {reason}")]
    ExecutableNotFound { name: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GolemError>;

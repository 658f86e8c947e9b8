//! WolfMeta Error Types

use std::path::PathBuf;

use thiserror::Error;

use crate::proto::Status;

/// Result type alias for WolfMeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMeta error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Serialization errors
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Snapshot errors
    #[error("Snapshot at {path} corrupted: {reason}")]
    SnapshotCorrupted { path: PathBuf, reason: String },

    // Metadata errors
    #[error("Operation failed with status {0:?}")]
    Status(Status),

    #[error("Partition {0} not found")]
    PartitionNotFound(u64),

    #[error("No partition owns inode {0}")]
    NoPartitionForInode(u64),

    #[error("No writable partition available")]
    NoWritablePartition,

    #[error("Invalid partition topology: {0}")]
    InvalidTopology(String),

    #[error("Partition {0} is stopped")]
    PartitionStopped(u64),

    // Replication errors
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // Network errors
    #[error("Unknown opcode {0:#x}")]
    UnknownOpCode(u8),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Control plane errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Master error: {0}")]
    Master(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable against another partition
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::NotLeader(_)
                | Error::Status(Status::Again)
        )
    }

    /// Collapse the error onto the per-operation status taxonomy
    pub fn status(&self) -> Status {
        match self {
            Error::Status(status) => *status,
            Error::PartitionNotFound(_) | Error::NoPartitionForInode(_) => Status::Noent,
            Error::NoWritablePartition => Status::Full,
            Error::ConnectionTimeout(_)
            | Error::ConnectionFailed { .. }
            | Error::Network(_)
            | Error::NotLeader(_) => Status::Again,
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::Codec(_)
            | Error::Json(_)
            | Error::UnknownOpCode(_) => Status::Inval,
            _ => Status::Error,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout("10.0.0.1:17210".into()).is_retryable());
        assert!(Error::Status(Status::Again).is_retryable());
        assert!(!Error::Status(Status::Noent).is_retryable());
        assert!(!Error::PartitionNotFound(3).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::PartitionNotFound(3).status(), Status::Noent);
        assert_eq!(Error::Status(Status::Exist).status(), Status::Exist);
        assert_eq!(Error::ConnectionTimeout("a".into()).status(), Status::Again);
        assert_eq!(Error::Internal("boom".into()).status(), Status::Error);
    }
}

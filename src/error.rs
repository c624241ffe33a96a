//! Error types
//!
//! `StorageError` covers the low-level layers (metadata backends, lock files,
//! session encoding). `FsError` is the taxonomy surfaced to callers of the
//! storage engine and maps onto protocol status codes.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the on-disk layers below the engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Does not exist: {0}")]
    NotExist(PathBuf),

    #[error("Failed to encode: {0}")]
    Encode(String),

    #[error("Failed to decode: {0}")]
    Decode(String),

    #[error("Invalid attribute {key}: {reason}")]
    InvalidAttribute { key: String, reason: String },

    #[error("Lock error: {0}")]
    Lock(String),
}

/// Errors returned by storage engine operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Storage(StorageError::Io(err))
    }
}

impl From<config::ConfigError> for FsError {
    fn from(err: config::ConfigError) -> Self {
        FsError::ConfigError(err.to_string())
    }
}

impl FsError {
    /// Status code a protocol handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FsError::NotFound(_) => 404,
            FsError::PermissionDenied(_) => 403,
            FsError::PreconditionFailed(_) => 412,
            FsError::Locked(_) => 423,
            FsError::AlreadyExists(_) => 409,
            FsError::InvalidArgument(_) => 400,
            FsError::Aborted(_) => 499,
            FsError::Internal(_) | FsError::Storage(_) | FsError::ConfigError(_) => 500,
        }
    }

    /// Client-facing message. Never carries paths, IDs or lock internals.
    pub fn public_message(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "resource not found",
            FsError::PermissionDenied(_) => "permission denied",
            FsError::PreconditionFailed(_) => "precondition failed",
            FsError::Locked(_) => "resource is locked",
            FsError::AlreadyExists(_) => "resource already exists",
            FsError::InvalidArgument(_) => "invalid request",
            FsError::Aborted(_) => "request aborted",
            FsError::Internal(_) | FsError::Storage(_) | FsError::ConfigError(_) => {
                "internal server error"
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Wrap a lower level failure as an internal error with context.
    pub fn internal(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        FsError::Internal(format!("{}: {}", context, err))
    }
}

//! Remote-filesystem error type.

use crate::remotefs::types::RemotePath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Categorised remote-filesystem error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsError {
    pub kind: FsErrorKind,
    pub message: String,
    /// Remote path the operation was working on, if any.
    pub path: Option<String>,
    /// `user@host:port` of the endpoint, if known.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FsErrorKind {
    /// Session could not be established or was lost.
    ConnectionFailed,
    /// The filesystem / pool entry has been shut down.
    Closed,
    /// No channel became available.
    PoolExhausted,
    /// Operation timed out.
    Timeout,
    NotFound,
    AlreadyExists,
    /// Directory still has entries.
    NotEmpty,
    /// A file operation was attempted on a directory.
    IsDirectory,
    /// A path component is a file where a directory is required.
    NotDirectory,
    PermissionDenied,
    /// Read / write after close or after an unrecoverable failure.
    StreamClosed,
    /// A recoverable fault repeated at the same offset.
    RetriesExhausted,
    Unsupported,
    InvalidConfig,
    InvalidPath,
    /// Server replied with something the client did not understand.
    ProtocolError,
    IoError,
}

pub type FsResult<T> = Result<T, FsError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FsError {
    pub fn new(kind: FsErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            path: None,
            endpoint: None,
        }
    }

    pub fn with_path(mut self, path: impl fmt::Display) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl fmt::Display) -> Self {
        if self.endpoint.is_none() {
            self.endpoint = Some(endpoint.to_string());
        }
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::ConnectionFailed, msg)
    }

    pub fn closed() -> Self {
        Self::new(FsErrorKind::Closed, "Filesystem closed")
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::PoolExhausted, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Timeout, msg)
    }

    pub fn not_found(path: &RemotePath) -> Self {
        Self::new(FsErrorKind::NotFound, format!("File {} does not exist.", path)).with_path(path)
    }

    pub fn source_missing(path: &RemotePath) -> Self {
        Self::new(FsErrorKind::NotFound, format!("Source path {} does not exist", path))
            .with_path(path)
    }

    pub fn already_exists(path: &RemotePath) -> Self {
        Self::new(FsErrorKind::AlreadyExists, format!("File already exists: {}", path))
            .with_path(path)
    }

    pub fn rename_target_exists(path: &RemotePath) -> Self {
        Self::new(
            FsErrorKind::AlreadyExists,
            format!("Destination path {} already exist, cannot rename!", path),
        )
        .with_path(path)
    }

    pub fn not_empty(path: &RemotePath) -> Self {
        Self::new(FsErrorKind::NotEmpty, format!("Directory: {} is not empty.", path))
            .with_path(path)
    }

    pub fn is_directory(path: &RemotePath) -> Self {
        Self::new(FsErrorKind::IsDirectory, format!("Path {} is a directory.", path))
            .with_path(path)
    }

    pub fn not_directory(path: &RemotePath) -> Self {
        Self::new(
            FsErrorKind::NotDirectory,
            format!("Can't make directory for path {} since it is a file.", path),
        )
        .with_path(path)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::PermissionDenied, msg)
    }

    pub fn stream_closed() -> Self {
        Self::new(FsErrorKind::StreamClosed, "Stream closed")
    }

    pub fn stream_failed() -> Self {
        Self::new(FsErrorKind::StreamClosed, "Stream failed earlier and cannot be used")
    }

    pub fn retries_exhausted(path: &RemotePath, pos: u64, cause: impl fmt::Display) -> Self {
        Self::new(
            FsErrorKind::RetriesExhausted,
            format!("Read of {} failed twice at offset {}: {}", path, pos, cause),
        )
        .with_path(path)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Unsupported, msg)
    }

    pub fn seek_unsupported() -> Self {
        Self::unsupported("Seek not supported")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::InvalidConfig, msg)
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::InvalidPath, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FsErrorKind::IoError, msg)
    }

    /// Faults that say nothing about the session being healthy afterwards.
    pub fn poisons_channel(&self) -> bool {
        matches!(
            self.kind,
            FsErrorKind::ConnectionFailed
                | FsErrorKind::Timeout
                | FsErrorKind::IoError
                | FsErrorKind::ProtocolError
        )
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(ep) => write!(f, "[RemoteFS {:?} {}] {}", self.kind, ep, self.message),
            None => write!(f, "[RemoteFS {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FsErrorKind::Timeout,
            io::ErrorKind::NotFound => FsErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => FsErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => FsErrorKind::AlreadyExists,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => FsErrorKind::ConnectionFailed,
            _ => FsErrorKind::IoError,
        };
        Self::new(kind, format!("I/O error: {}", e))
    }
}

impl From<FsError> for String {
    fn from(e: FsError) -> String {
        e.to_string()
    }
}

//! # sorng-remotefs — Resilient Remote Filesystem Layer
//!
//! Hides the instability of long-lived FTP / SFTP control and data
//! connections behind a stable, retryable interface.
//!
//! Architecture:
//! - `types` — paths, file status, endpoint / pool config, stats snapshots
//! - `error` — remote-filesystem error type
//! - `endpoint` — immutable connection target + session connector
//! - `channel` — session capability traits and the pooled `Channel` handle
//! - `pool` — bounded per-endpoint connection pool
//! - `dir_tree` — caching and non-caching directory trees
//! - `keepalive` — control-connection NOOP timer
//! - `stats` — shared byte / operation counters
//! - `stream` — reconnect-and-resume read stream
//! - `write` — upload stream that refreshes the tree on close
//! - `service` — high-level filesystem facade (owns pool handle, tree, stats)
//! - `backend` — in-memory sessions and (feature `sftp`) libssh2 sessions

pub mod types;
pub mod error;
pub mod endpoint;
pub mod channel;
pub mod pool;
pub mod dir_tree;
pub mod keepalive;
pub mod stats;
pub mod stream;
pub mod write;
pub mod service;
pub mod backend;

pub use types::*;
pub use error::{FsError, FsErrorKind, FsResult};
pub use endpoint::{Connector, Endpoint, SessionFuture};
pub use channel::{Channel, ChannelId, DataReader, DataWriter, RemoteSession};
pub use pool::ConnectionPool;
pub use dir_tree::{CachedDirTree, DirTree, Node, UncachedDirTree};
pub use stats::FsStatistics;
pub use stream::ResilientReadStream;
pub use write::RemoteWriteStream;
pub use service::{RemoteFs, RemoteFsState};

use lazy_static::lazy_static;
use std::sync::Mutex as StdMutex;

lazy_static! {
    /// Process-wide pool handed out by `ConnectionPool::global()`.
    pub(crate) static ref GLOBAL_POOL: StdMutex<Option<ConnectionPool>> = StdMutex::new(None);
}

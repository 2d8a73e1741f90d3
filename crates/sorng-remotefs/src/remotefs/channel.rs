//! Session capability traits and the `Channel` handle the pool hands out.
//!
//! A protocol client implements [`RemoteSession`]; everything above it
//! (pool, tree, streams) only ever talks to a [`Channel`].

use crate::remotefs::endpoint::Endpoint;
use crate::remotefs::error::FsResult;
use crate::remotefs::pool::Lease;
use crate::remotefs::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

// ─── Data streams ────────────────────────────────────────────────────

/// Data stream opened for reading. Errors stay `io::Error` so a stalled
/// transfer keeps its `TimedOut` kind.
#[async_trait]
pub trait DataReader: Send {
    /// `Ok(0)` means the server closed the data stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait DataWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Flush and complete the transfer.
    async fn close(&mut self) -> io::Result<()>;
}

/// Adapts any tokio reader (TCP data socket, TLS stream, …).
pub struct AsyncReadAdapter<R> {
    inner: R,
}

impl<R> AsyncReadAdapter<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> DataReader for AsyncReadAdapter<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct AsyncWriteAdapter<W> {
    inner: W,
}

impl<W> AsyncWriteAdapter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> DataWriter for AsyncWriteAdapter<W> {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await
    }
}

// ─── Protocol session ────────────────────────────────────────────────

/// One authenticated connection to a remote server.
///
/// Methods take `&self`; implementations serialise access to their control
/// connection internally.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Whether the server still accepts commands on this session.
    fn is_available(&self) -> bool {
        self.is_connected()
    }

    async fn pwd(&self) -> FsResult<RemotePath>;

    async fn list(&self, dir: &RemotePath) -> FsResult<Vec<FileStatus>>;

    /// Fails with `NotFound` when the path does not exist.
    async fn stat(&self, path: &RemotePath) -> FsResult<FileStatus>;

    /// Like [`stat`](Self::stat), but also returns the full parent listing
    /// when the protocol had to list the parent to answer (FTP `LIST`).
    async fn stat_with_listing(
        &self,
        path: &RemotePath,
    ) -> FsResult<(FileStatus, Option<Vec<FileStatus>>)> {
        Ok((self.stat(path).await?, None))
    }

    async fn open_read(&self, path: &RemotePath, offset: u64) -> FsResult<Box<dyn DataReader>>;

    async fn open_write(&self, path: &RemotePath) -> FsResult<Box<dyn DataWriter>>;

    async fn mkdir(&self, path: &RemotePath) -> FsResult<()>;

    async fn remove_file(&self, path: &RemotePath) -> FsResult<()>;

    async fn remove_dir(&self, path: &RemotePath) -> FsResult<()>;

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> FsResult<()>;

    async fn set_times(
        &self,
        path: &RemotePath,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> FsResult<()>;

    /// No-op on the control connection (FTP `NOOP`, SSH keepalive).
    async fn keep_alive(&self) -> FsResult<()>;

    async fn disconnect(&self) -> FsResult<()>;
}

// ─── Channel ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live session bound to its endpoint.
///
/// Pooled channels carry a lease on their pool slot; dropping a channel
/// without handing it back releases the slot and disconnects the session.
pub struct Channel {
    id: ChannelId,
    endpoint: Arc<Endpoint>,
    session: Arc<dyn RemoteSession>,
    pooled: bool,
    pub(crate) lease: Option<Lease>,
    destroyed: bool,
}

impl Channel {
    /// Wrap a freshly opened session. `lease` is `Some` for pooled channels.
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        session: Arc<dyn RemoteSession>,
        lease: Option<Lease>,
    ) -> Self {
        Self {
            id: ChannelId::new(),
            endpoint,
            session,
            pooled: lease.is_some(),
            lease,
            destroyed: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Shared handle to the underlying session (keep-alive timer).
    pub fn session(&self) -> Arc<dyn RemoteSession> {
        Arc::clone(&self.session)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Liveness check used before reuse.
    pub fn is_valid(&self) -> bool {
        self.session.is_connected() && self.session.is_available()
    }

    // ── Delegated operations ─────────────────────────────────────

    pub async fn pwd(&self) -> FsResult<RemotePath> {
        self.session.pwd().await.map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn list(&self, dir: &RemotePath) -> FsResult<Vec<FileStatus>> {
        self.session.list(dir).await.map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn stat(&self, path: &RemotePath) -> FsResult<FileStatus> {
        self.session.stat(path).await.map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn stat_with_listing(
        &self,
        path: &RemotePath,
    ) -> FsResult<(FileStatus, Option<Vec<FileStatus>>)> {
        self.session
            .stat_with_listing(path)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn open_read(&self, path: &RemotePath, offset: u64) -> FsResult<Box<dyn DataReader>> {
        self.session
            .open_read(path, offset)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn open_write(&self, path: &RemotePath) -> FsResult<Box<dyn DataWriter>> {
        self.session
            .open_write(path)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn mkdir(&self, path: &RemotePath) -> FsResult<()> {
        self.session.mkdir(path).await.map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn remove_file(&self, path: &RemotePath) -> FsResult<()> {
        self.session
            .remove_file(path)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn remove_dir(&self, path: &RemotePath) -> FsResult<()> {
        self.session
            .remove_dir(path)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn rename(&self, from: &RemotePath, to: &RemotePath) -> FsResult<()> {
        self.session
            .rename(from, to)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn set_times(
        &self,
        path: &RemotePath,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        self.session
            .set_times(path, modified, accessed)
            .await
            .map_err(|e| e.with_endpoint(&self.endpoint))
    }

    pub async fn keep_alive(&self) -> FsResult<()> {
        self.session.keep_alive().await
    }

    /// Disconnect the session for good. Errors are logged, not returned.
    pub(crate) async fn destroy(mut self) {
        self.destroyed = true;
        log::debug!("RemoteFS channel {} to {}: destroying", self.id, self.endpoint);
        if self.session.is_connected() {
            if let Err(e) = self.session.disconnect().await {
                log::warn!(
                    "RemoteFS channel {} to {}: disconnect failed: {}",
                    self.id,
                    self.endpoint,
                    e
                );
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.destroyed || !self.session.is_connected() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(&self.session);
            handle.spawn(async move {
                let _ = session.disconnect().await;
            });
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("pooled", &self.pooled)
            .field("connected", &self.session.is_connected())
            .finish()
    }
}

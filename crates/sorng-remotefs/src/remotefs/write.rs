//! Upload stream. Writes are never retried; a failed transfer is reported
//! and its channel destroyed.

use crate::remotefs::channel::{Channel, DataWriter};
use crate::remotefs::dir_tree::DirTree;
use crate::remotefs::error::{FsError, FsResult};
use crate::remotefs::pool::ConnectionPool;
use crate::remotefs::stats::FsStatistics;
use crate::remotefs::types::*;
use log::debug;
use std::sync::Arc;

pub struct RemoteWriteStream {
    pool: ConnectionPool,
    channel: Option<Channel>,
    writer: Option<Box<dyn DataWriter>>,
    path: RemotePath,
    tree: Arc<dyn DirTree>,
    stats: Arc<FsStatistics>,
    written: u64,
    state: StreamState,
}

impl std::fmt::Debug for RemoteWriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWriteStream")
            .field("path", &self.path)
            .field("written", &self.written)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RemoteWriteStream {
    pub(crate) fn new(
        pool: ConnectionPool,
        channel: Channel,
        writer: Box<dyn DataWriter>,
        path: RemotePath,
        tree: Arc<dyn DirTree>,
        stats: Arc<FsStatistics>,
    ) -> Self {
        Self {
            pool,
            channel: Some(channel),
            writer: Some(writer),
            path,
            tree,
            stats,
            written: 0,
            state: StreamState::Open,
        }
    }

    pub fn path(&self) -> &RemotePath {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Write all of `buf`.
    pub async fn write(&mut self, buf: &[u8]) -> FsResult<()> {
        if self.state != StreamState::Open {
            return Err(FsError::stream_closed().with_path(&self.path));
        }
        let mut offset = 0;
        while offset < buf.len() {
            let Some(writer) = self.writer.as_mut() else {
                return Err(FsError::stream_closed().with_path(&self.path));
            };
            match writer.write(&buf[offset..]).await {
                Ok(0) => {
                    self.abort().await;
                    return Err(FsError::io_error("Data stream accepted no bytes").with_path(&self.path));
                }
                Ok(n) => {
                    offset += n;
                    self.written += n as u64;
                    self.stats.record_write(n);
                }
                Err(e) => {
                    self.abort().await;
                    return Err(FsError::from(e).with_path(&self.path));
                }
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.state = StreamState::Failed;
        self.writer = None;
        self.tree.invalidate(&self.path);
        if let Some(channel) = self.channel.take() {
            self.pool.disconnect(channel, true).await;
        }
    }

    /// Complete the transfer and refresh the cached entry.
    pub async fn close(&mut self) -> FsResult<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let failed = self.state == StreamState::Failed;
        self.state = StreamState::Closed;
        if failed {
            return Ok(());
        }

        let result = match self.writer.take() {
            Some(mut writer) => writer.close().await,
            None => Ok(()),
        };
        self.tree.invalidate(&self.path);
        if let Some(channel) = self.channel.take() {
            self.pool.disconnect(channel, result.is_err()).await;
        }
        debug!("RemoteFS write {}: closed after {} bytes", self.path, self.written);
        result.map_err(|e| FsError::from(e).with_path(&self.path))
    }
}

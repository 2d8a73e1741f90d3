// ── RemoteFs – filesystem facade over one mounted endpoint ──────────────────

use crate::remotefs::channel::Channel;
use crate::remotefs::dir_tree::{self, DirTree, Node};
use crate::remotefs::endpoint::Endpoint;
use crate::remotefs::error::{FsError, FsErrorKind, FsResult};
use crate::remotefs::pool::ConnectionPool;
use crate::remotefs::stats::FsStatistics;
use crate::remotefs::stream::ResilientReadStream;
use crate::remotefs::types::*;
use crate::remotefs::write::RemoteWriteStream;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type RemoteFsState = Arc<RemoteFs>;

/// One mounted remote filesystem. Owns its directory tree and statistics and
/// borrows channels from a (possibly shared) pool.
pub struct RemoteFs {
    endpoint: Arc<Endpoint>,
    pool: ConnectionPool,
    tree: Arc<dyn DirTree>,
    stats: Arc<FsStatistics>,
    closed: AtomicBool,
}

impl RemoteFs {
    pub fn mount(endpoint: Arc<Endpoint>, pool: ConnectionPool) -> RemoteFsState {
        pool.init(&endpoint);
        let tree = dir_tree::for_endpoint(&endpoint);
        info!(
            "RemoteFS mounted {}://{} (directory cache {})",
            endpoint.protocol(),
            endpoint,
            if tree.is_caching() { "on" } else { "off" }
        );
        Arc::new(Self {
            endpoint,
            pool,
            tree,
            stats: Arc::new(FsStatistics::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn tree(&self) -> &Arc<dyn DirTree> {
        &self.tree
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats(&self.endpoint)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Channel helpers ──────────────────────────────────────────────────────

    async fn checkout(&self) -> FsResult<Channel> {
        if self.is_closed() {
            return Err(FsError::closed().with_endpoint(&self.endpoint));
        }
        self.pool.connect(&self.endpoint).await
    }

    async fn checkin<T>(&self, channel: Channel, result: &FsResult<T>) {
        let hard = matches!(result, Err(e) if e.poisons_channel());
        self.pool.disconnect(channel, hard).await;
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub async fn file_status(&self, path: &RemotePath) -> FsResult<FileStatus> {
        let channel = self.checkout().await?;
        let result = self.tree.add_node(&channel, path).await.map(Node::into_status);
        self.checkin(channel, &result).await;
        result
    }

    pub async fn exists(&self, path: &RemotePath) -> FsResult<bool> {
        match self.file_status(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == FsErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Entries of a directory, or the file itself.
    pub async fn list_status(&self, path: &RemotePath) -> FsResult<Vec<FileStatus>> {
        let channel = self.checkout().await?;
        let result = self.list_with(&channel, path).await;
        self.checkin(channel, &result).await;
        result
    }

    async fn list_with(&self, channel: &Channel, path: &RemotePath) -> FsResult<Vec<FileStatus>> {
        let node = self.tree.add_node(channel, path).await?;
        if !node.is_dir() {
            return Ok(vec![node.into_status()]);
        }
        if self.tree.is_caching() {
            let children = self.tree.children(channel, &node).await?;
            Ok(children.into_iter().map(Node::into_status).collect())
        } else {
            channel.list(path).await
        }
    }

    pub async fn home_directory(&self) -> FsResult<RemotePath> {
        let channel = self.checkout().await?;
        let result = channel.pwd().await;
        self.checkin(channel, &result).await;
        result.map_err(|e| {
            warn!("RemoteFS {}: failed to get home directory: {}", self.endpoint, e);
            e
        })
    }

    pub async fn set_times(
        &self,
        path: &RemotePath,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        let channel = self.checkout().await?;
        let result = match self.tree.add_node(&channel, path).await {
            Ok(_) => channel.set_times(path, modified, accessed).await,
            Err(e) => Err(e),
        };
        self.tree.invalidate(path);
        self.checkin(channel, &result).await;
        result
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    /// Open a file for reading. The stream keeps its channel until closed.
    pub async fn open(&self, path: &RemotePath) -> FsResult<ResilientReadStream> {
        let channel = self.checkout().await?;
        let status = match self.tree.add_node(&channel, path).await {
            Ok(node) => node.into_status(),
            Err(e) => {
                self.pool.disconnect(channel, e.poisons_channel()).await;
                return Err(e);
            }
        };
        debug!("RemoteFS open {} ({} bytes)", path, status.len);
        ResilientReadStream::open(self.pool.clone(), channel, status, Arc::clone(&self.stats)).await
    }

    /// Create (or with `overwrite`, replace) a file. Missing parent
    /// directories are created.
    pub async fn create(&self, path: &RemotePath, overwrite: bool) -> FsResult<RemoteWriteStream> {
        if path.is_root() {
            return Err(FsError::is_directory(path));
        }
        let channel = self.checkout().await?;
        if let Err(e) = self.prepare_create(&channel, path, overwrite).await {
            self.pool.disconnect(channel, e.poisons_channel()).await;
            return Err(e);
        }
        match channel.open_write(path).await {
            Ok(writer) => Ok(RemoteWriteStream::new(
                self.pool.clone(),
                channel,
                writer,
                path.clone(),
                Arc::clone(&self.tree),
                Arc::clone(&self.stats),
            )),
            Err(e) => {
                self.pool.disconnect(channel, e.poisons_channel()).await;
                Err(e)
            }
        }
    }

    async fn prepare_create(&self, channel: &Channel, path: &RemotePath, overwrite: bool) -> FsResult<()> {
        match self.tree.add_node(channel, path).await {
            Ok(node) if node.is_dir() => Err(FsError::is_directory(path)),
            Ok(_) if !overwrite => Err(FsError::already_exists(path)),
            Ok(_) => Ok(()),
            Err(e) if e.kind == FsErrorKind::NotFound => match path.parent() {
                Some(parent) => self.mkdirs_with(channel, &parent).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        }
    }

    // ── Namespace ────────────────────────────────────────────────────────────

    /// Create `path` and any missing ancestors.
    pub async fn mkdirs(&self, path: &RemotePath) -> FsResult<()> {
        let channel = self.checkout().await?;
        let result = self.mkdirs_with(&channel, path).await;
        self.checkin(channel, &result).await;
        result
    }

    async fn mkdirs_with(&self, channel: &Channel, path: &RemotePath) -> FsResult<()> {
        for dir in path.lineage().iter().skip(1) {
            match self.tree.add_node(channel, dir).await {
                Ok(node) if node.is_dir() => {}
                Ok(_) => return Err(FsError::not_directory(dir)),
                Err(e) if e.kind == FsErrorKind::NotFound => {
                    match channel.mkdir(dir).await {
                        Ok(()) => debug!("RemoteFS mkdir {}", dir),
                        // Lost a race with another client; fine as long as it is a directory.
                        Err(e) if e.kind == FsErrorKind::AlreadyExists => {}
                        Err(e) => return Err(e),
                    }
                    self.tree.invalidate(dir);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a file or directory. `Ok(false)` for root or a missing path.
    pub async fn delete(&self, path: &RemotePath, recursive: bool) -> FsResult<bool> {
        if path.is_root() {
            warn!("RemoteFS {}: refusing to delete root", self.endpoint);
            return Ok(false);
        }
        let channel = self.checkout().await?;
        let result = self.delete_with(&channel, path, recursive).await;
        self.checkin(channel, &result).await;
        result
    }

    async fn delete_with(&self, channel: &Channel, path: &RemotePath, recursive: bool) -> FsResult<bool> {
        let node = match self.tree.add_node(channel, path).await {
            Ok(node) => node,
            Err(e) if e.kind == FsErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if node.is_dir() && !recursive && !self.list_with(channel, path).await?.is_empty() {
            return Err(FsError::not_empty(path));
        }
        self.remove_tree(channel, node.into_status()).await?;
        Ok(true)
    }

    fn remove_tree<'a>(&'a self, channel: &'a Channel, status: FileStatus) -> BoxFuture<'a, FsResult<()>> {
        Box::pin(async move {
            if status.is_dir() {
                for child in channel.list(&status.path).await? {
                    self.remove_tree(channel, child).await?;
                }
                channel.remove_dir(&status.path).await?;
            } else {
                channel.remove_file(&status.path).await?;
            }
            self.tree.remove_node(&status.path);
            Ok(())
        })
    }

    /// Rename `src` to `dst`. An existing directory at `dst` receives `src`
    /// under its own name.
    pub async fn rename(&self, src: &RemotePath, dst: &RemotePath) -> FsResult<()> {
        let channel = self.checkout().await?;
        let result = self.rename_with(&channel, src, dst).await;
        self.checkin(channel, &result).await;
        result
    }

    async fn rename_with(&self, channel: &Channel, src: &RemotePath, dst: &RemotePath) -> FsResult<()> {
        if src.is_root() {
            return Err(FsError::unsupported("Cannot rename root directory"));
        }
        match self.tree.add_node(channel, src).await {
            Ok(_) => {}
            Err(e) if e.kind == FsErrorKind::NotFound => return Err(FsError::source_missing(src)),
            Err(e) => return Err(e),
        }

        let target = match self.tree.add_node(channel, dst).await {
            Ok(node) if node.is_dir() => dst.join(src.name()),
            Ok(_) => return Err(FsError::rename_target_exists(dst)),
            Err(e) if e.kind == FsErrorKind::NotFound => dst.clone(),
            Err(e) => return Err(e),
        };
        if target.starts_with(src) {
            return Err(FsError::unsupported(format!("Cannot move {} into itself", src)));
        }
        if target != *dst {
            match self.tree.add_node(channel, &target).await {
                Ok(_) => return Err(FsError::rename_target_exists(&target)),
                Err(e) if e.kind == FsErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        channel.rename(src, &target).await?;
        self.tree.remove_node(src);
        self.tree.invalidate(&target);
        info!("RemoteFS rename {} -> {}", src, target);
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Shut the endpoint down in the pool and drop the cache. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.shutdown(&self.endpoint).await;
        self.tree.clear();
        info!("RemoteFS unmounted {}", self.endpoint);
    }
}

//! Directory tree: caches remote metadata so repeated lookups and listings
//! skip the network.
//!
//! Two variants share the [`DirTree`] trait: [`CachedDirTree`] keeps an
//! arena of nodes keyed by path, [`UncachedDirTree`] always asks the server.

use crate::remotefs::channel::Channel;
use crate::remotefs::endpoint::Endpoint;
use crate::remotefs::error::{FsError, FsErrorKind, FsResult};
use crate::remotefs::types::*;
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Snapshot of one cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    status: FileStatus,
    complete: bool,
}

impl Node {
    pub fn path(&self) -> &RemotePath {
        &self.status.path
    }

    pub fn status(&self) -> &FileStatus {
        &self.status
    }

    pub fn into_status(self) -> FileStatus {
        self.status
    }

    /// Directory: every child is cached. File: status is known.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_dir(&self) -> bool {
        self.status.is_dir()
    }
}

#[async_trait]
pub trait DirTree: Send + Sync {
    /// Cached node for `path`, fetching it (and any missing ancestors)
    /// through `channel` on a miss.
    async fn add_node(&self, channel: &Channel, path: &RemotePath) -> FsResult<Node>;

    /// Cache-only lookup. `Ok(None)` is a plain miss; `Err(NotFound)` means
    /// the cache proves the path does not exist.
    fn find_node(&self, path: &RemotePath) -> FsResult<Option<Node>>;

    /// Evict `path` and everything below it. `false` for root or a miss.
    fn remove_node(&self, path: &RemotePath) -> bool;

    /// Drop `path` and forget that its parent's listing was complete, so
    /// the next lookup goes back to the server.
    fn invalidate(&self, path: &RemotePath);

    /// Children of `dir`, listing through `channel` unless already complete.
    async fn children(&self, channel: &Channel, dir: &Node) -> FsResult<Vec<Node>>;

    /// Store a full listing of `dir` obtained elsewhere.
    fn add_all(&self, dir: &RemotePath, listing: Vec<FileStatus>);

    /// Forget everything except root.
    fn clear(&self);

    fn is_caching(&self) -> bool;
}

/// Tree matching the endpoint's caching policy.
pub fn for_endpoint(endpoint: &Endpoint) -> Arc<dyn DirTree> {
    if endpoint.cache_directories() {
        Arc::new(CachedDirTree::new())
    } else {
        Arc::new(UncachedDirTree)
    }
}

// ─── Caching tree ────────────────────────────────────────────────────

struct NodeEntry {
    status: FileStatus,
    complete: bool,
    children: BTreeSet<RemotePath>,
}

impl NodeEntry {
    fn new(status: FileStatus) -> Self {
        let complete = !status.is_dir();
        Self {
            status,
            complete,
            children: BTreeSet::new(),
        }
    }

    fn node(&self) -> Node {
        Node {
            status: self.status.clone(),
            complete: self.complete,
        }
    }
}

type Arena = HashMap<RemotePath, NodeEntry>;

pub struct CachedDirTree {
    nodes: RwLock<Arena>,
}

impl Default for CachedDirTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedDirTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let root = RemotePath::root();
        nodes.insert(root.clone(), NodeEntry::new(FileStatus::directory(root)));
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.nodes.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.nodes.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of cached nodes, root included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn lookup(nodes: &Arena, path: &RemotePath) -> FsResult<Option<Node>> {
        if let Some(entry) = nodes.get(path) {
            return Ok(Some(entry.node()));
        }
        // Deepest cached ancestor decides between "unknown" and "absent".
        let lineage = path.lineage();
        let mut deepest = None;
        for ancestor in &lineage[..lineage.len() - 1] {
            match nodes.get(ancestor) {
                Some(entry) => deepest = Some(entry),
                None => break,
            }
        }
        match deepest {
            Some(entry) if !entry.status.is_dir() || entry.complete => {
                Err(FsError::not_found(path))
            }
            _ => Ok(None),
        }
    }

    /// Insert or refresh one entry and link it under its parent (if cached).
    fn upsert(nodes: &mut Arena, status: FileStatus) {
        let path = status.path.clone();
        let kind_changed = nodes
            .get(&path)
            .map(|e| e.status.kind != status.kind)
            .unwrap_or(false);
        if kind_changed {
            Self::evict(nodes, &path);
        }
        match nodes.get_mut(&path) {
            Some(entry) => entry.status = status,
            None => {
                nodes.insert(path.clone(), NodeEntry::new(status));
            }
        }
        if let Some(parent) = path.parent() {
            if let Some(parent_entry) = nodes.get_mut(&parent) {
                parent_entry.children.insert(path);
            }
        }
    }

    /// Replace the children of `dir` with `listing` and mark it complete.
    fn store_listing(nodes: &mut Arena, dir: &RemotePath, listing: Vec<FileStatus>) {
        if !nodes.contains_key(dir) {
            Self::upsert(nodes, FileStatus::directory(dir.clone()));
        }
        let fresh: BTreeSet<RemotePath> = listing.iter().map(|s| s.path.clone()).collect();
        let gone: Vec<RemotePath> = nodes
            .get(dir)
            .map(|e| e.children.difference(&fresh).cloned().collect())
            .unwrap_or_default();
        for path in gone {
            Self::evict(nodes, &path);
        }
        for status in listing {
            if status.path.parent().as_ref() == Some(dir) {
                Self::upsert(nodes, status);
            }
        }
        if let Some(entry) = nodes.get_mut(dir) {
            entry.complete = true;
        }
    }

    /// Remove `path` with its subtree and unlink it from the parent.
    fn evict(nodes: &mut Arena, path: &RemotePath) -> bool {
        let Some(entry) = nodes.remove(path) else {
            return false;
        };
        let mut pending: Vec<RemotePath> = entry.children.into_iter().collect();
        while let Some(child) = pending.pop() {
            if let Some(e) = nodes.remove(&child) {
                pending.extend(e.children);
            }
        }
        if let Some(parent) = path.parent() {
            if let Some(parent_entry) = nodes.get_mut(&parent) {
                parent_entry.children.remove(path);
            }
        }
        true
    }

    fn children_of(nodes: &Arena, dir: &RemotePath) -> Vec<Node> {
        nodes
            .get(dir)
            .map(|e| {
                e.children
                    .iter()
                    .filter_map(|c| nodes.get(c).map(NodeEntry::node))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DirTree for CachedDirTree {
    async fn add_node(&self, channel: &Channel, path: &RemotePath) -> FsResult<Node> {
        if let Some(node) = self.find_node(path)? {
            trace!("Dir tree: hit {}", path);
            return Ok(node);
        }

        if let Some(parent) = path.parent() {
            match self.add_node(channel, &parent).await {
                Ok(node) if node.is_dir() => {}
                Ok(_) => return Err(FsError::not_found(path)),
                Err(e) if e.kind == FsErrorKind::NotFound => return Err(FsError::not_found(path)),
                Err(e) => return Err(e),
            }
        }

        let (status, listing) = channel.stat_with_listing(path).await?;
        let mut nodes = self.write();
        if let (Some(listing), Some(parent)) = (listing, path.parent()) {
            debug!("Dir tree: caching {} entries of {}", listing.len(), parent);
            Self::store_listing(&mut nodes, &parent, listing);
        }
        if !nodes.contains_key(path) {
            Self::upsert(&mut nodes, status.clone());
        }
        Ok(nodes
            .get(path)
            .map(NodeEntry::node)
            .unwrap_or_else(|| NodeEntry::new(status).node()))
    }

    fn find_node(&self, path: &RemotePath) -> FsResult<Option<Node>> {
        Self::lookup(&self.read(), path)
    }

    fn remove_node(&self, path: &RemotePath) -> bool {
        if path.is_root() {
            return false;
        }
        let removed = Self::evict(&mut self.write(), path);
        if removed {
            debug!("Dir tree: evicted {}", path);
        }
        removed
    }

    fn invalidate(&self, path: &RemotePath) {
        let mut nodes = self.write();
        if !path.is_root() {
            Self::evict(&mut nodes, path);
        }
        let parent = path.parent().unwrap_or_else(RemotePath::root);
        if let Some(entry) = nodes.get_mut(&parent) {
            entry.complete = false;
        }
        if path.is_root() {
            if let Some(entry) = nodes.get_mut(path) {
                entry.complete = false;
            }
        }
    }

    async fn children(&self, channel: &Channel, dir: &Node) -> FsResult<Vec<Node>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        {
            let nodes = self.read();
            if nodes.get(dir.path()).map(|e| e.complete).unwrap_or(false) {
                trace!("Dir tree: listing hit {}", dir.path());
                return Ok(Self::children_of(&nodes, dir.path()));
            }
        }

        let listing = match channel.list(dir.path()).await {
            Ok(listing) => listing,
            Err(e) if e.kind == FsErrorKind::NotFound => {
                self.remove_node(dir.path());
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let mut nodes = self.write();
        Self::store_listing(&mut nodes, dir.path(), listing);
        Ok(Self::children_of(&nodes, dir.path()))
    }

    fn add_all(&self, dir: &RemotePath, listing: Vec<FileStatus>) {
        Self::store_listing(&mut self.write(), dir, listing);
    }

    fn clear(&self) {
        let mut nodes = self.write();
        nodes.clear();
        let root = RemotePath::root();
        nodes.insert(root.clone(), NodeEntry::new(FileStatus::directory(root)));
    }

    fn is_caching(&self) -> bool {
        true
    }
}

// ─── Non-caching tree ────────────────────────────────────────────────

/// Pass-through tree: every lookup is a fresh `stat`.
pub struct UncachedDirTree;

#[async_trait]
impl DirTree for UncachedDirTree {
    async fn add_node(&self, channel: &Channel, path: &RemotePath) -> FsResult<Node> {
        let status = channel.stat(path).await?;
        Ok(Node {
            status,
            complete: false,
        })
    }

    fn find_node(&self, _path: &RemotePath) -> FsResult<Option<Node>> {
        Ok(None)
    }

    fn remove_node(&self, _path: &RemotePath) -> bool {
        false
    }

    fn invalidate(&self, _path: &RemotePath) {}

    async fn children(&self, _channel: &Channel, _dir: &Node) -> FsResult<Vec<Node>> {
        Ok(Vec::new())
    }

    fn add_all(&self, _dir: &RemotePath, _listing: Vec<FileStatus>) {}

    fn clear(&self) {}

    fn is_caching(&self) -> bool {
        false
    }
}

//! In-process remote server.
//!
//! `MemoryServer` holds a file tree shared by every `MemorySession` it
//! opens. Call counters and fault hooks let tests observe round-trips and
//! break sessions or data streams on demand.

use crate::remotefs::channel::{DataReader, DataWriter, RemoteSession};
use crate::remotefs::endpoint::{Connector, Endpoint, SessionFuture};
use crate::remotefs::error::{FsError, FsResult};
use crate::remotefs::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

// ─── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemEntry {
    kind: EntryKind,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    accessed: DateTime<Utc>,
}

impl MemEntry {
    fn dir() -> Self {
        let now = Utc::now();
        Self {
            kind: EntryKind::Directory,
            data: Vec::new(),
            modified: now,
            accessed: now,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            kind: EntryKind::File,
            data,
            ..Self::dir()
        }
    }

    fn status(&self, path: &RemotePath) -> FileStatus {
        FileStatus {
            path: path.clone(),
            kind: self.kind,
            len: self.data.len() as u64,
            modified: Some(self.modified),
            accessed: Some(self.accessed),
            permissions: Some(if self.kind == EntryKind::Directory { 0o755 } else { 0o644 }),
            owner: None,
            group: None,
        }
    }
}

struct ServerState {
    entries: BTreeMap<RemotePath, MemEntry>,
    home: RemotePath,
    read_faults: VecDeque<io::ErrorKind>,
    refuse_connections: bool,
}

impl ServerState {
    fn is_dir(&self, path: &RemotePath) -> bool {
        self.entries
            .get(path)
            .map(|e| e.kind == EntryKind::Directory)
            .unwrap_or(false)
    }

    fn children(&self, dir: &RemotePath) -> Vec<FileStatus> {
        self.entries
            .iter()
            .filter(|(p, _)| p.parent().as_ref() == Some(dir))
            .map(|(p, e)| e.status(p))
            .collect()
    }

    fn ensure_parents(&mut self, path: &RemotePath) -> FsResult<()> {
        let lineage = path.lineage();
        for ancestor in &lineage[..lineage.len() - 1] {
            match self.entries.get(ancestor) {
                Some(e) if e.kind == EntryKind::Directory => {}
                Some(_) => return Err(FsError::not_directory(ancestor)),
                None => {
                    self.entries.insert(ancestor.clone(), MemEntry::dir());
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    list: AtomicUsize,
    stat: AtomicUsize,
    noop: AtomicUsize,
    open_reads: AtomicUsize,
}

/// Shared in-memory file tree. Cloning shares the same server.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<StdMutex<ServerState>>,
    counters: Arc<Counters>,
    generation: Arc<AtomicU64>,
    listing_stat: Arc<AtomicBool>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(RemotePath::root(), MemEntry::dir());
        Self {
            state: Arc::new(StdMutex::new(ServerState {
                entries,
                home: RemotePath::root(),
                read_faults: VecDeque::new(),
                refuse_connections: false,
            })),
            counters: Arc::new(Counters::default()),
            generation: Arc::new(AtomicU64::new(0)),
            listing_stat: Arc::new(AtomicBool::new(true)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Connector opening sessions against this server.
    pub fn connector(&self) -> Connector {
        let server = self.clone();
        Arc::new(move |endpoint: Arc<Endpoint>| -> SessionFuture {
            let server = server.clone();
            Box::pin(async move {
                let session = server.open_session(&endpoint)?;
                Ok(Arc::new(session) as Arc<dyn RemoteSession>)
            })
        })
    }

    /// Endpoint bound to this server's connector.
    pub fn endpoint(&self, config: EndpointConfig) -> FsResult<Arc<Endpoint>> {
        Endpoint::from_config(config, self.connector())
    }

    fn open_session(&self, endpoint: &Endpoint) -> FsResult<MemorySession> {
        if self.state().refuse_connections {
            return Err(FsError::connection_failed(format!(
                "Connection to {} refused",
                endpoint
            )));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("Memory server: session opened for {}", endpoint);
        Ok(MemorySession {
            server: self.clone(),
            generation: self.generation.load(Ordering::SeqCst),
            connected: AtomicBool::new(true),
        })
    }

    // ── Content ──────────────────────────────────────────────────

    /// Create or replace a file, creating missing parent directories.
    pub fn put_file(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        let path = RemotePath::parse(path)?;
        let mut state = self.state();
        state.ensure_parents(&path)?;
        if state.is_dir(&path) {
            return Err(FsError::is_directory(&path));
        }
        state.entries.insert(path, MemEntry::file(data.as_ref().to_vec()));
        Ok(())
    }

    pub fn put_dir(&self, path: &str) -> FsResult<()> {
        let path = RemotePath::parse(path)?;
        let mut state = self.state();
        state.ensure_parents(&path)?;
        match state.entries.get(&path) {
            Some(e) if e.kind == EntryKind::File => Err(FsError::already_exists(&path)),
            Some(_) => Ok(()),
            None => {
                state.entries.insert(path, MemEntry::dir());
                Ok(())
            }
        }
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let path = RemotePath::parse(path).ok()?;
        self.state()
            .entries
            .get(&path)
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        RemotePath::parse(path)
            .map(|p| self.state().entries.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn set_home(&self, path: &str) -> FsResult<()> {
        let path = RemotePath::parse(path)?;
        self.state().home = path;
        Ok(())
    }

    // ── Behaviour switches ───────────────────────────────────────

    /// When on (default), `stat_with_listing` answers by listing the parent
    /// the way FTP servers without `MLST` have to.
    pub fn set_listing_stat(&self, on: bool) {
        self.listing_stat.store(on, Ordering::SeqCst);
    }

    /// The next `n` data streams opened for reading fail with `kind`.
    pub fn fail_next_reads(&self, n: usize, kind: io::ErrorKind) {
        let mut state = self.state();
        for _ in 0..n {
            state.read_faults.push_back(kind);
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Every session opened so far stops reporting itself connected.
    pub fn drop_all_sessions(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    // ── Counters ─────────────────────────────────────────────────

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions_opened().saturating_sub(self.sessions_closed())
    }

    pub fn list_calls(&self) -> usize {
        self.counters.list.load(Ordering::SeqCst)
    }

    pub fn stat_calls(&self) -> usize {
        self.counters.stat.load(Ordering::SeqCst)
    }

    pub fn noop_calls(&self) -> usize {
        self.counters.noop.load(Ordering::SeqCst)
    }

    pub fn open_reads(&self) -> usize {
        self.counters.open_reads.load(Ordering::SeqCst)
    }
}

// ─── Session ─────────────────────────────────────────────────────────

pub struct MemorySession {
    server: MemoryServer,
    generation: u64,
    connected: AtomicBool,
}

impl MemorySession {
    fn ensure_connected(&self) -> FsResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FsError::connection_failed("Session disconnected"))
        }
    }

    fn require_parent_dir(state: &ServerState, path: &RemotePath) -> FsResult<()> {
        match path.parent() {
            Some(parent) if state.is_dir(&parent) => Ok(()),
            Some(parent) if state.entries.contains_key(&parent) => Err(FsError::not_directory(&parent)),
            Some(parent) => Err(FsError::not_found(&parent)),
            None => Err(FsError::unsupported("Operation not permitted on root")),
        }
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.generation == self.server.generation.load(Ordering::SeqCst)
    }

    async fn pwd(&self) -> FsResult<RemotePath> {
        self.ensure_connected()?;
        Ok(self.server.state().home.clone())
    }

    async fn list(&self, dir: &RemotePath) -> FsResult<Vec<FileStatus>> {
        self.ensure_connected()?;
        self.server.counters.list.fetch_add(1, Ordering::SeqCst);
        let state = self.server.state();
        match state.entries.get(dir) {
            None => Err(FsError::not_found(dir)),
            Some(e) if e.kind != EntryKind::Directory => Err(FsError::not_directory(dir)),
            Some(_) => Ok(state.children(dir)),
        }
    }

    async fn stat(&self, path: &RemotePath) -> FsResult<FileStatus> {
        self.ensure_connected()?;
        self.server.counters.stat.fetch_add(1, Ordering::SeqCst);
        self.server
            .state()
            .entries
            .get(path)
            .map(|e| e.status(path))
            .ok_or_else(|| FsError::not_found(path))
    }

    async fn stat_with_listing(
        &self,
        path: &RemotePath,
    ) -> FsResult<(FileStatus, Option<Vec<FileStatus>>)> {
        let parent = match path.parent() {
            Some(parent) if self.server.listing_stat.load(Ordering::SeqCst) => parent,
            _ => return Ok((self.stat(path).await?, None)),
        };
        let listing = match self.list(&parent).await {
            Ok(listing) => listing,
            Err(e) if e.kind == crate::remotefs::FsErrorKind::NotDirectory => {
                return Err(FsError::not_found(path))
            }
            Err(e) => return Err(e),
        };
        let status = listing
            .iter()
            .find(|s| &s.path == path)
            .cloned()
            .ok_or_else(|| FsError::not_found(path))?;
        Ok((status, Some(listing)))
    }

    async fn open_read(&self, path: &RemotePath, offset: u64) -> FsResult<Box<dyn DataReader>> {
        self.ensure_connected()?;
        self.server.counters.open_reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.server.state();
        if let Some(kind) = state.read_faults.pop_front() {
            return Ok(Box::new(FaultyReader { kind }));
        }
        let entry = state.entries.get(path).ok_or_else(|| FsError::not_found(path))?;
        if entry.kind == EntryKind::Directory {
            return Err(FsError::is_directory(path));
        }
        let start = (offset as usize).min(entry.data.len());
        Ok(Box::new(MemoryReader {
            data: entry.data[start..].to_vec(),
            pos: 0,
        }))
    }

    async fn open_write(&self, path: &RemotePath) -> FsResult<Box<dyn DataWriter>> {
        self.ensure_connected()?;
        let mut state = self.server.state();
        Self::require_parent_dir(&state, path)?;
        if state.is_dir(path) {
            return Err(FsError::is_directory(path));
        }
        state.entries.insert(path.clone(), MemEntry::file(Vec::new()));
        Ok(Box::new(MemoryWriter {
            server: self.server.clone(),
            path: path.clone(),
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &RemotePath) -> FsResult<()> {
        self.ensure_connected()?;
        let mut state = self.server.state();
        Self::require_parent_dir(&state, path)?;
        if state.entries.contains_key(path) {
            return Err(FsError::already_exists(path));
        }
        state.entries.insert(path.clone(), MemEntry::dir());
        Ok(())
    }

    async fn remove_file(&self, path: &RemotePath) -> FsResult<()> {
        self.ensure_connected()?;
        let mut state = self.server.state();
        match state.entries.get(path) {
            None => Err(FsError::not_found(path)),
            Some(e) if e.kind == EntryKind::Directory => Err(FsError::is_directory(path)),
            Some(_) => {
                state.entries.remove(path);
                Ok(())
            }
        }
    }

    async fn remove_dir(&self, path: &RemotePath) -> FsResult<()> {
        self.ensure_connected()?;
        if path.is_root() {
            return Err(FsError::unsupported("Cannot remove root directory"));
        }
        let mut state = self.server.state();
        match state.entries.get(path) {
            None => return Err(FsError::not_found(path)),
            Some(e) if e.kind != EntryKind::Directory => return Err(FsError::not_directory(path)),
            Some(_) => {}
        }
        if !state.children(path).is_empty() {
            return Err(FsError::not_empty(path));
        }
        state.entries.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> FsResult<()> {
        self.ensure_connected()?;
        if from.is_root() || to.starts_with(from) {
            return Err(FsError::unsupported(format!("Cannot move {} into {}", from, to)));
        }
        let mut state = self.server.state();
        if !state.entries.contains_key(from) {
            return Err(FsError::source_missing(from));
        }
        if state.entries.contains_key(to) {
            return Err(FsError::rename_target_exists(to));
        }
        Self::require_parent_dir(&state, to)?;

        let moved: Vec<RemotePath> = state
            .entries
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = state.entries.remove(&old) {
                let new = if old == *from {
                    to.clone()
                } else {
                    to.join(&old.as_str()[from.as_str().len() + 1..])
                };
                state.entries.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn set_times(
        &self,
        path: &RemotePath,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        self.ensure_connected()?;
        let mut state = self.server.state();
        let entry = state.entries.get_mut(path).ok_or_else(|| FsError::not_found(path))?;
        if let Some(m) = modified {
            entry.modified = m;
        }
        if let Some(a) = accessed {
            entry.accessed = a;
        }
        Ok(())
    }

    async fn keep_alive(&self) -> FsResult<()> {
        self.ensure_connected()?;
        self.server.counters.noop.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> FsResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.server.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ─── Data streams ────────────────────────────────────────────────────

/// Snapshot of the file taken when the stream was opened.
struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl DataReader for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FaultyReader {
    kind: io::ErrorKind,
}

#[async_trait]
impl DataReader for FaultyReader {
    async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(self.kind, "injected data stream fault"))
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Appends straight into the server's copy of the file.
struct MemoryWriter {
    server: MemoryServer,
    path: RemotePath,
    closed: bool,
}

#[async_trait]
impl DataWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Stream closed"));
        }
        let mut state = self.server.state();
        let entry = state
            .entries
            .get_mut(&self.path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.path.to_string()))?;
        entry.data.extend_from_slice(buf);
        entry.modified = Utc::now();
        Ok(buf.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

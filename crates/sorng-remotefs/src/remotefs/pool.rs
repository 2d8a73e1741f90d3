//! Connection pool: a bounded set of channels keyed by endpoint.
//!
//! Per endpoint the pool tracks idle channels (reused LIFO) and the number
//! of pooled channels currently checked out. Sessions are opened and
//! disconnected outside the bookkeeping lock.

use crate::remotefs::channel::Channel;
use crate::remotefs::endpoint::Endpoint;
use crate::remotefs::error::{FsError, FsResult};
use crate::remotefs::types::*;
use crate::remotefs::GLOBAL_POOL;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

#[derive(Default)]
struct PoolEntry {
    idle: Vec<Channel>,
    checked_out: usize,
    closed: bool,
}

struct PoolInner {
    entries: StdMutex<HashMap<Arc<Endpoint>, PoolEntry>>,
    /// Signalled whenever a slot frees up or an entry shuts down.
    released: Notify,
    max_connections: AtomicUsize,
    exhaustion: ExhaustionPolicy,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Arc<Endpoint>, PoolEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective_max(&self, endpoint: &Endpoint) -> usize {
        endpoint
            .max_connections()
            .min(self.max_connections.load(Ordering::SeqCst))
            .max(1)
    }

    fn release_slot(&self, endpoint: &Arc<Endpoint>) {
        if let Some(entry) = self.lock().get_mut(endpoint) {
            entry.checked_out = entry.checked_out.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// Claim on one checked-out slot. Dropping an armed lease gives the slot back.
pub(crate) struct Lease {
    pool: Weak<PoolInner>,
    endpoint: Arc<Endpoint>,
    armed: bool,
}

impl Lease {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            debug!("RemoteFS pool: slot for {} released by drop", self.endpoint);
            pool.release_slot(&self.endpoint);
        }
    }
}

enum Checkout {
    Idle(Channel),
    Reserved(Lease),
    Exhausted,
}

/// Shared handle to a connection pool. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: StdMutex::new(HashMap::new()),
                released: Notify::new(),
                max_connections: AtomicUsize::new(config.max_connections.max(1)),
                exhaustion: config.exhaustion,
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            }),
        }
    }

    pub fn with_max_connections(max_connections: usize) -> Self {
        Self::new(PoolConfig {
            max_connections,
            ..PoolConfig::default()
        })
    }

    /// Process-wide pool, created with defaults on first use.
    pub fn global() -> ConnectionPool {
        let mut slot = GLOBAL_POOL.lock().unwrap_or_else(|p| p.into_inner());
        slot.get_or_insert_with(|| ConnectionPool::new(PoolConfig::default()))
            .clone()
    }

    /// Forget the process-wide pool. Outstanding handles keep working; the
    /// next `global()` call builds a fresh one.
    pub fn reset_global() -> Option<ConnectionPool> {
        GLOBAL_POOL.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections.load(Ordering::SeqCst)
    }

    // ── Checkout ─────────────────────────────────────────────────

    /// Check out a channel for `endpoint`.
    pub async fn connect(&self, endpoint: &Arc<Endpoint>) -> FsResult<Channel> {
        let deadline = Instant::now() + self.inner.acquire_timeout;
        loop {
            // Register for wake-ups before inspecting state so a release
            // between the check and the wait is not lost.
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let (step, stale) = self.try_checkout(endpoint)?;
            for channel in stale {
                channel.destroy().await;
            }

            match step {
                Checkout::Idle(channel) => {
                    debug!("RemoteFS pool: reusing channel {} for {}", channel.id(), endpoint);
                    return Ok(channel);
                }
                Checkout::Reserved(lease) => {
                    // A failed or cancelled connect drops the lease and frees the slot.
                    let session = endpoint.open_session().await?;
                    let channel = Channel::new(Arc::clone(endpoint), session, Some(lease));
                    debug!("RemoteFS pool: opened channel {} for {}", channel.id(), endpoint);
                    return Ok(channel);
                }
                Checkout::Exhausted => match self.inner.exhaustion {
                    ExhaustionPolicy::Overflow => {
                        let session = endpoint.open_session().await?;
                        let channel = Channel::new(Arc::clone(endpoint), session, None);
                        debug!(
                            "RemoteFS pool: {} exhausted, handing out unpooled channel {}",
                            endpoint,
                            channel.id()
                        );
                        return Ok(channel);
                    }
                    ExhaustionPolicy::Fail => {
                        return Err(self.exhausted_error(endpoint));
                    }
                    ExhaustionPolicy::Block => {
                        if time::timeout_at(deadline, released).await.is_err() {
                            return Err(self.exhausted_error(endpoint));
                        }
                    }
                },
            }
        }
    }

    fn exhausted_error(&self, endpoint: &Arc<Endpoint>) -> FsError {
        FsError::pool_exhausted(format!(
            "Pool limit reached ({})",
            self.inner.effective_max(endpoint)
        ))
        .with_endpoint(endpoint)
    }

    fn try_checkout(&self, endpoint: &Arc<Endpoint>) -> FsResult<(Checkout, Vec<Channel>)> {
        let max = self.inner.effective_max(endpoint);
        let mut entries = self.inner.lock();
        let entry = entries.entry(Arc::clone(endpoint)).or_default();
        if entry.closed {
            return Err(FsError::closed().with_endpoint(endpoint));
        }

        let mut stale = Vec::new();
        while let Some(mut channel) = entry.idle.pop() {
            if channel.is_valid() {
                entry.checked_out += 1;
                channel.lease = Some(self.lease(endpoint));
                return Ok((Checkout::Idle(channel), stale));
            }
            debug!("RemoteFS pool: dropping dead idle channel {}", channel.id());
            stale.push(channel);
        }

        if entry.checked_out + entry.idle.len() < max {
            entry.checked_out += 1;
            Ok((Checkout::Reserved(self.lease(endpoint)), stale))
        } else {
            Ok((Checkout::Exhausted, stale))
        }
    }

    fn lease(&self, endpoint: &Arc<Endpoint>) -> Lease {
        Lease {
            pool: Arc::downgrade(&self.inner),
            endpoint: Arc::clone(endpoint),
            armed: true,
        }
    }

    // ── Return ───────────────────────────────────────────────────

    /// Return a channel. It is destroyed instead of kept when `hard_close`
    /// is set, it is unpooled or dead, its endpoint is shut down, or keeping
    /// it would exceed the current limit.
    pub async fn disconnect(&self, mut channel: Channel, hard_close: bool) {
        if !channel.is_pooled() {
            channel.destroy().await;
            return;
        }
        if let Some(lease) = channel.lease.take() {
            lease.disarm();
        }

        let endpoint = Arc::clone(channel.endpoint());
        let max = self.inner.effective_max(&endpoint);
        let doomed = {
            let mut entries = self.inner.lock();
            match entries.get_mut(&endpoint) {
                Some(entry) => {
                    entry.checked_out = entry.checked_out.saturating_sub(1);
                    let over_limit = entry.idle.len() + entry.checked_out >= max;
                    if hard_close || entry.closed || over_limit || !channel.is_valid() {
                        Some(channel)
                    } else {
                        debug!("RemoteFS pool: channel {} back to idle", channel.id());
                        entry.idle.push(channel);
                        None
                    }
                }
                None => Some(channel),
            }
        };
        self.inner.released.notify_waiters();

        if let Some(channel) = doomed {
            channel.destroy().await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open (or re-open after shutdown) the entry for `endpoint`.
    pub fn init(&self, endpoint: &Arc<Endpoint>) {
        let mut entries = self.inner.lock();
        let entry = entries.entry(Arc::clone(endpoint)).or_default();
        if entry.closed {
            info!("RemoteFS pool: re-opening {}", endpoint);
        }
        entry.closed = false;
    }

    /// Close the entry for `endpoint` and destroy its idle channels.
    /// Channels still checked out are destroyed when they come back.
    pub async fn shutdown(&self, endpoint: &Arc<Endpoint>) {
        let drained = {
            let mut entries = self.inner.lock();
            let entry = entries.entry(Arc::clone(endpoint)).or_default();
            entry.closed = true;
            std::mem::take(&mut entry.idle)
        };
        self.inner.released.notify_waiters();
        info!(
            "RemoteFS pool: shut down {} ({} idle channels destroyed)",
            endpoint,
            drained.len()
        );
        for channel in drained {
            channel.destroy().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let endpoints: Vec<Arc<Endpoint>> = self.inner.lock().keys().cloned().collect();
        for endpoint in endpoints {
            self.shutdown(&endpoint).await;
        }
    }

    /// Change the global cap. Checked-out channels are left alone; surplus
    /// idle channels are destroyed, oldest first.
    pub async fn set_max_connections(&self, max_connections: usize) {
        let max_connections = max_connections.max(1);
        let previous = self.inner.max_connections.swap(max_connections, Ordering::SeqCst);
        if previous != max_connections {
            info!("RemoteFS pool: max connections {} -> {}", previous, max_connections);
        }

        let mut surplus = Vec::new();
        {
            let mut entries = self.inner.lock();
            for (endpoint, entry) in entries.iter_mut() {
                let max = self.inner.effective_max(endpoint);
                while !entry.idle.is_empty() && entry.idle.len() + entry.checked_out > max {
                    surplus.push(entry.idle.remove(0));
                }
            }
        }
        self.inner.released.notify_waiters();

        if !surplus.is_empty() {
            warn!("RemoteFS pool: trimming {} idle channels", surplus.len());
        }
        for channel in surplus {
            channel.destroy().await;
        }
    }

    pub fn stats(&self, endpoint: &Arc<Endpoint>) -> PoolStats {
        let max = self.inner.effective_max(endpoint);
        let entries = self.inner.lock();
        let (idle, checked_out, closed) = entries
            .get(endpoint)
            .map(|e| (e.idle.len(), e.checked_out, e.closed))
            .unwrap_or((0, 0, false));
        PoolStats {
            endpoint: endpoint.to_string(),
            idle,
            checked_out,
            max,
            closed,
        }
    }
}

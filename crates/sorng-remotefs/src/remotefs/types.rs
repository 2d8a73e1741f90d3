//! Shared types for the remote filesystem crate.

use crate::remotefs::error::{FsError, FsResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Paths ───────────────────────────────────────────────────────────

/// Normalised absolute remote path. Used as the directory-tree cache key.
///
/// Always starts with `/`, never ends with one (except root), and contains
/// no empty, `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalise an absolute path. `..` above root stays at root.
    pub fn parse(raw: &str) -> FsResult<Self> {
        if !raw.starts_with('/') {
            return Err(FsError::invalid_path(format!(
                "Remote path '{}' is not absolute",
                raw
            )));
        }
        let mut parts: Vec<&str> = Vec::new();
        for comp in raw.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                c => parts.push(c),
            }
        }
        Ok(Self::from_components(&parts))
    }

    fn from_components(parts: &[&str]) -> Self {
        if parts.is_empty() {
            Self::root()
        } else {
            Self(format!("/{}", parts.join("/")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last component, empty for root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a relative path (may contain several components).
    pub fn join(&self, rel: &str) -> RemotePath {
        let mut joined = String::with_capacity(self.0.len() + rel.len() + 1);
        joined.push_str(&self.0);
        joined.push('/');
        joined.push_str(rel);
        // A string starting with '/' always parses.
        Self::parse(&joined).unwrap_or_else(|_| self.clone())
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Root, every ancestor, and finally the path itself, outermost first.
    pub fn lineage(&self) -> Vec<RemotePath> {
        let comps: Vec<&str> = self.components().collect();
        (0..=comps.len())
            .map(|n| Self::from_components(&comps[..n]))
            .collect()
    }

    /// `true` if `self` equals `other` or lives somewhere below it.
    pub fn starts_with(&self, other: &RemotePath) -> bool {
        if other.is_root() || self == other {
            return true;
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0.as_bytes()[other.0.len()] == b'/'
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RemotePath {
    type Error = FsError;

    fn try_from(raw: String) -> FsResult<Self> {
        Self::parse(&raw)
    }
}

impl From<RemotePath> for String {
    fn from(p: RemotePath) -> String {
        p.0
    }
}

// ─── File status ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Metadata snapshot for one remote entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub path: RemotePath,
    pub kind: EntryKind,
    pub len: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl FileStatus {
    pub fn file(path: RemotePath, len: u64) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            len,
            modified: None,
            accessed: None,
            permissions: None,
            owner: None,
            group: None,
        }
    }

    pub fn directory(path: RemotePath) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(path, 0)
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

// ─── Endpoint configuration ──────────────────────────────────────────

/// Remote protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
    /// In-process server, used for tests and embedding.
    Memory,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp => 22,
            Protocol::Memory => 0,
        }
    }

    pub fn requires_user(self) -> bool {
        !matches!(self, Protocol::Memory)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Ftp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
            Protocol::Memory => "memory",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProxyKind {
    None,
    Http,
    Socks4,
    Socks5,
}

impl ProxyKind {
    pub fn default_port(self) -> Option<u16> {
        match self {
            ProxyKind::None => None,
            ProxyKind::Http => Some(8080),
            ProxyKind::Socks4 | ProxyKind::Socks5 => Some(1080),
        }
    }
}

impl Default for ProxyKind {
    fn default() -> Self {
        Self::None
    }
}

/// Proxy in front of the remote server. The handshake itself belongs to the
/// protocol client; this only carries the settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub kind: ProxyKind,
    #[serde(default)]
    pub host: Option<String>,
    /// Falls back to 8080 for HTTP and 1080 for SOCKS.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn effective_port(&self) -> Option<u16> {
        match self.kind {
            ProxyKind::None => None,
            kind => self.port.or_else(|| kind.default_port()),
        }
    }
}

fn default_max_connections() -> usize {
    5
}

fn default_keepalive_period() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_data_timeout() -> u64 {
    30
}

/// User-facing endpoint configuration (JSON from the frontend / settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    /// Protocol default when omitted.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Upper bound of pooled channels for this endpoint.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub use_keepalive: bool,
    #[serde(default = "default_keepalive_period")]
    pub keepalive_period_sec: u64,
    #[serde(default)]
    pub cache_directories: bool,
    /// 0 waits as long as the server takes.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Data-stream inactivity after which a read reports a timeout. 0
    /// disables the limit.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
}

impl EndpointConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: None,
            user: None,
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            proxy: ProxyConfig::default(),
            max_connections: default_max_connections(),
            use_keepalive: false,
            keepalive_period_sec: default_keepalive_period(),
            cache_directories: false,
            connect_timeout_sec: default_connect_timeout(),
            data_timeout_sec: default_data_timeout(),
        }
    }

    pub fn from_json(json: &str) -> FsResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FsError::invalid_config(format!("Invalid endpoint config: {}", e)))
    }
}

// ─── Pool configuration ──────────────────────────────────────────────

/// What `connect` does when an endpoint has no free slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExhaustionPolicy {
    /// Wait for a returned channel, up to the acquire timeout.
    Block,
    /// Hand out an unpooled channel that is destroyed on disconnect.
    Overflow,
    /// Fail immediately.
    Fail,
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        Self::Block
    }
}

fn default_acquire_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Global cap applied on top of every endpoint's own limit.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            exhaustion: ExhaustionPolicy::default(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

// ─── Snapshots ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub endpoint: String,
    pub idle: usize,
    pub checked_out: usize,
    pub max: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub bytes_read: u64,
    pub read_ops: u64,
    pub bytes_written: u64,
    pub write_ops: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    Open,
    Failed,
    Closed,
}

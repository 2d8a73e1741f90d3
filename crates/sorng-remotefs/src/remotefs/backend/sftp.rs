// ── SFTP sessions over libssh2 ──────────────────────────────────────────────
//
// ssh2 is blocking; every call runs on the blocking pool.

use crate::remotefs::channel::{DataReader, DataWriter, RemoteSession};
use crate::remotefs::endpoint::{Connector, Endpoint, SessionFuture};
use crate::remotefs::error::{FsError, FsErrorKind, FsResult};
use crate::remotefs::types::*;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`.
const SESSION_TIMEOUT: i32 = -9;

/// Connector opening SFTP sessions for any SFTP endpoint.
pub fn connector() -> Connector {
    Arc::new(|endpoint: Arc<Endpoint>| -> SessionFuture {
        Box::pin(async move {
            let target = Arc::clone(&endpoint);
            let handle = tokio::task::spawn_blocking(move || SshHandle::connect(&target))
                .await
                .map_err(|e| FsError::connection_failed(format!("SFTP connect task failed: {}", e)))??;
            info!("SFTP session opened to {}", endpoint);
            Ok(Arc::new(SftpSession {
                handle: Arc::new(handle),
                label: endpoint.to_string(),
                connected: AtomicBool::new(true),
            }) as Arc<dyn RemoteSession>)
        })
    })
}

// ── Error / attribute mapping ────────────────────────────────────────────────

fn map_ssh_error(e: ssh2::Error, path: Option<&RemotePath>) -> FsError {
    let kind = match e.code() {
        ErrorCode::SFTP(2) | ErrorCode::SFTP(10) => FsErrorKind::NotFound,
        ErrorCode::SFTP(3) => FsErrorKind::PermissionDenied,
        ErrorCode::SFTP(8) => FsErrorKind::Unsupported,
        ErrorCode::SFTP(11) => FsErrorKind::AlreadyExists,
        ErrorCode::SFTP(18) => FsErrorKind::NotEmpty,
        ErrorCode::SFTP(_) => FsErrorKind::IoError,
        ErrorCode::Session(SESSION_TIMEOUT) => FsErrorKind::Timeout,
        ErrorCode::Session(_) => FsErrorKind::ConnectionFailed,
    };
    let err = FsError::new(kind, format!("SFTP: {}", e));
    match path {
        Some(p) => err.with_path(p),
        None => err,
    }
}

fn timestamp(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn to_status(path: RemotePath, stat: &FileStat) -> FileStatus {
    let mode = stat.perm.unwrap_or(0);
    let kind = match mode & 0o170000 {
        0o040000 => EntryKind::Directory,
        0o120000 => EntryKind::Symlink,
        _ if stat.is_dir() => EntryKind::Directory,
        _ => EntryKind::File,
    };
    FileStatus {
        path,
        kind,
        len: stat.size.unwrap_or(0),
        modified: stat.mtime.and_then(timestamp),
        accessed: stat.atime.and_then(timestamp),
        permissions: stat.perm.map(|p| p & 0o7777),
        owner: stat.uid.map(|u| u.to_string()),
        group: stat.gid.map(|g| g.to_string()),
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

struct SshHandle {
    session: Session,
    sftp: Sftp,
    #[allow(dead_code)] // keeps the socket open for the session
    tcp: TcpStream,
}

impl SshHandle {
    fn connect(endpoint: &Endpoint) -> FsResult<Self> {
        if endpoint.proxy().kind != ProxyKind::None {
            return Err(FsError::unsupported("SFTP through a proxy is not supported"));
        }
        let addr = format!("{}:{}", endpoint.host(), endpoint.port());
        let sock = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FsError::connection_failed(format!("Cannot resolve {}", addr)))?;
        let tcp = match endpoint.connect_timeout() {
            Some(limit) => TcpStream::connect_timeout(&sock, limit)?,
            None => TcpStream::connect(sock)?,
        };

        let mut session = Session::new().map_err(|e| map_ssh_error(e, None))?;
        session.set_tcp_stream(tcp.try_clone()?);
        // libssh2 reads 0 as "block forever".
        let data_timeout_ms = endpoint
            .data_timeout()
            .map_or(0, |d| d.as_millis().min(u32::MAX as u128) as u32);
        session.set_timeout(data_timeout_ms);
        session
            .handshake()
            .map_err(|e| FsError::connection_failed(format!("SSH handshake with {} failed: {}", addr, e)))?;

        Self::authenticate(&session, endpoint)?;

        if let Some(period) = endpoint.keepalive() {
            session.set_keepalive(true, period.as_secs() as u32);
        }
        let sftp = session.sftp().map_err(|e| map_ssh_error(e, None))?;
        Ok(Self { session, sftp, tcp })
    }

    fn authenticate(session: &Session, endpoint: &Endpoint) -> FsResult<()> {
        let user = endpoint.user().unwrap_or_default();
        if let Some(key) = endpoint.private_key_path() {
            match session.userauth_pubkey_file(user, None, Path::new(key), endpoint.private_key_passphrase()) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("SFTP {}: public-key auth failed: {}", endpoint, e),
            }
        }
        if let Some(password) = endpoint.password() {
            match session.userauth_password(user, password) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("SFTP {}: password auth failed: {}", endpoint, e),
            }
        }
        Err(FsError::permission_denied(format!("Authentication failed for {}", endpoint)))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct SftpSession {
    handle: Arc<SshHandle>,
    label: String,
    connected: AtomicBool,
}

impl SftpSession {
    async fn blocking<T, F>(&self, op: F) -> FsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SshHandle) -> FsResult<T> + Send + 'static,
    {
        if !self.is_connected() {
            return Err(FsError::connection_failed("SFTP session disconnected"));
        }
        let handle = Arc::clone(&self.handle);
        let result = tokio::task::spawn_blocking(move || op(&handle))
            .await
            .map_err(|e| FsError::io_error(format!("SFTP worker failed: {}", e)))?;
        if let Err(e) = &result {
            if matches!(e.kind, FsErrorKind::ConnectionFailed) {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn pwd(&self) -> FsResult<RemotePath> {
        self.blocking(|h| {
            let home = h.sftp.realpath(Path::new(".")).map_err(|e| map_ssh_error(e, None))?;
            RemotePath::parse(&home.to_string_lossy())
        })
        .await
    }

    async fn list(&self, dir: &RemotePath) -> FsResult<Vec<FileStatus>> {
        let dir = dir.clone();
        self.blocking(move |h| {
            let entries = h
                .sftp
                .readdir(Path::new(dir.as_str()))
                .map_err(|e| map_ssh_error(e, Some(&dir)))?;
            Ok(entries
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().to_string();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(to_status(dir.join(&name), &stat))
                })
                .collect())
        })
        .await
    }

    async fn stat(&self, path: &RemotePath) -> FsResult<FileStatus> {
        let path = path.clone();
        self.blocking(move |h| {
            let stat = h
                .sftp
                .stat(Path::new(path.as_str()))
                .map_err(|e| map_ssh_error(e, Some(&path)))?;
            Ok(to_status(path, &stat))
        })
        .await
    }

    async fn open_read(&self, path: &RemotePath, offset: u64) -> FsResult<Box<dyn DataReader>> {
        let path = path.clone();
        let file = self
            .blocking(move |h| {
                let mut file = h
                    .sftp
                    .open(Path::new(path.as_str()))
                    .map_err(|e| map_ssh_error(e, Some(&path)))?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))?;
                }
                Ok(file)
            })
            .await?;
        Ok(Box::new(SftpReader { file: Some(file) }))
    }

    async fn open_write(&self, path: &RemotePath) -> FsResult<Box<dyn DataWriter>> {
        let path = path.clone();
        let file = self
            .blocking(move |h| {
                h.sftp
                    .create(Path::new(path.as_str()))
                    .map_err(|e| map_ssh_error(e, Some(&path)))
            })
            .await?;
        Ok(Box::new(SftpWriter { file: Some(file) }))
    }

    async fn mkdir(&self, path: &RemotePath) -> FsResult<()> {
        let path = path.clone();
        self.blocking(move |h| {
            h.sftp
                .mkdir(Path::new(path.as_str()), 0o755)
                .map_err(|e| map_ssh_error(e, Some(&path)))
        })
        .await
    }

    async fn remove_file(&self, path: &RemotePath) -> FsResult<()> {
        let path = path.clone();
        self.blocking(move |h| {
            h.sftp
                .unlink(Path::new(path.as_str()))
                .map_err(|e| map_ssh_error(e, Some(&path)))
        })
        .await
    }

    async fn remove_dir(&self, path: &RemotePath) -> FsResult<()> {
        let path = path.clone();
        self.blocking(move |h| {
            h.sftp
                .rmdir(Path::new(path.as_str()))
                .map_err(|e| map_ssh_error(e, Some(&path)))
        })
        .await
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> FsResult<()> {
        let (from, to) = (from.clone(), to.clone());
        self.blocking(move |h| {
            h.sftp
                .rename(Path::new(from.as_str()), Path::new(to.as_str()), None)
                .map_err(|e| map_ssh_error(e, Some(&from)))
        })
        .await
    }

    async fn set_times(
        &self,
        path: &RemotePath,
        modified: Option<DateTime<Utc>>,
        accessed: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        let path = path.clone();
        self.blocking(move |h| {
            let remote = Path::new(path.as_str());
            // SFTP sets both times at once; keep whichever was not given.
            let current = h.sftp.stat(remote).map_err(|e| map_ssh_error(e, Some(&path)))?;
            let stat = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: None,
                atime: accessed.map(|t| t.timestamp().max(0) as u64).or(current.atime),
                mtime: modified.map(|t| t.timestamp().max(0) as u64).or(current.mtime),
            };
            h.sftp.setstat(remote, stat).map_err(|e| map_ssh_error(e, Some(&path)))
        })
        .await
    }

    async fn keep_alive(&self) -> FsResult<()> {
        self.blocking(|h| {
            h.session.keepalive_send().map_err(|e| map_ssh_error(e, None))?;
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> FsResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = Arc::clone(&self.handle);
        let label = self.label.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = handle.session.disconnect(None, "Client disconnecting", None) {
                warn!("SFTP {}: disconnect failed: {}", label, e);
            }
        })
        .await
        .map_err(|e| FsError::io_error(format!("SFTP worker failed: {}", e)))?;
        info!("SFTP session to {} closed", self.label);
        Ok(())
    }
}

// ── Data streams ─────────────────────────────────────────────────────────────

fn worker_gone(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("SFTP worker failed: {}", e))
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "SFTP file closed")
}

/// The file moves onto the blocking pool for each call and comes back.
struct SftpReader {
    file: Option<ssh2::File>,
}

#[async_trait]
impl DataReader for SftpReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.take().ok_or_else(stream_closed)?;
        let len = buf.len();
        let (file, chunk) = tokio::task::spawn_blocking(move || {
            let mut chunk = vec![0u8; len];
            let res = file.read(&mut chunk).map(|n| {
                chunk.truncate(n);
                chunk
            });
            (file, res)
        })
        .await
        .map_err(worker_gone)?;
        self.file = Some(file);
        let chunk = chunk?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || file.close().map_err(io::Error::from))
            .await
            .map_err(worker_gone)?
    }
}

struct SftpWriter {
    file: Option<ssh2::File>,
}

#[async_trait]
impl DataWriter for SftpWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.take().ok_or_else(stream_closed)?;
        let chunk = buf.to_vec();
        let (file, res) = tokio::task::spawn_blocking(move || {
            let res = file.write(&chunk);
            (file, res)
        })
        .await
        .map_err(worker_gone)?;
        self.file = Some(file);
        res
    }

    async fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            file.flush()?;
            file.close().map_err(io::Error::from)
        })
        .await
        .map_err(worker_gone)?
    }
}

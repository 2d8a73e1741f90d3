//! Reconnect-and-resume read stream.
//!
//! An early end-of-stream (cursor still short of the known size) or a data
//! timeout is treated as recoverable: the channel is hard-closed, a fresh one
//! is checked out, the file is re-stat'ed and the transfer resumes at the
//! cursor. The same fault twice at one offset gives up. Any other I/O error
//! goes straight to the caller.

use crate::remotefs::channel::{Channel, DataReader};
use crate::remotefs::endpoint::Endpoint;
use crate::remotefs::error::{FsError, FsResult};
use crate::remotefs::keepalive::KeepAlive;
use crate::remotefs::pool::ConnectionPool;
use crate::remotefs::stats::FsStatistics;
use crate::remotefs::types::*;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use tokio::time;

enum Fault {
    EarlyEof,
    Timeout(io::Error),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::EarlyEof => f.write_str("data stream ended early"),
            Fault::Timeout(e) => write!(f, "data stream timed out: {}", e),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

pub struct ResilientReadStream {
    pool: ConnectionPool,
    endpoint: Arc<Endpoint>,
    channel: Option<Channel>,
    /// `None` while open means the file ended during a reconnect.
    reader: Option<Box<dyn DataReader>>,
    status: FileStatus,
    pos: u64,
    state: StreamState,
    last_fault_pos: Option<u64>,
    stats: Arc<FsStatistics>,
    keepalive: Option<KeepAlive>,
}

impl std::fmt::Debug for ResilientReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientReadStream")
            .field("status", &self.status)
            .field("pos", &self.pos)
            .field("state", &self.state)
            .field("last_fault_pos", &self.last_fault_pos)
            .finish_non_exhaustive()
    }
}

impl ResilientReadStream {
    /// Open `status.path` from the start on `channel`. The channel goes back
    /// to the pool (hard) if the data stream cannot be opened.
    pub async fn open(
        pool: ConnectionPool,
        channel: Channel,
        status: FileStatus,
        stats: Arc<FsStatistics>,
    ) -> FsResult<Self> {
        if status.is_dir() {
            pool.disconnect(channel, false).await;
            return Err(FsError::is_directory(&status.path));
        }
        match channel.open_read(&status.path, 0).await {
            Ok(reader) => Ok(Self::with_reader(pool, channel, reader, status, stats)),
            Err(e) => {
                pool.disconnect(channel, e.poisons_channel()).await;
                Err(e)
            }
        }
    }

    /// Wrap a data stream that is already open at offset 0.
    pub(crate) fn with_reader(
        pool: ConnectionPool,
        channel: Channel,
        reader: Box<dyn DataReader>,
        status: FileStatus,
        stats: Arc<FsStatistics>,
    ) -> Self {
        let keepalive = KeepAlive::for_channel(&channel);
        Self {
            pool,
            endpoint: Arc::clone(channel.endpoint()),
            channel: Some(channel),
            reader: Some(reader),
            status,
            pos: 0,
            state: StreamState::Open,
            last_fault_pos: None,
            stats,
            keepalive,
        }
    }

    pub fn path(&self) -> &RemotePath {
        &self.status.path
    }

    /// Latest known status; refreshed on every reconnect.
    pub fn status(&self) -> &FileStatus {
        &self.status
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn seek(&mut self, _pos: u64) -> FsResult<()> {
        Err(FsError::seek_unsupported())
    }

    /// Read into `buf`. `Ok(0)` is end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        match self.state {
            StreamState::Open => {}
            StreamState::Closed => return Err(FsError::stream_closed().with_path(self.path())),
            StreamState::Failed => return Err(FsError::stream_failed().with_path(self.path())),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(0);
            };
            let outcome = match self.endpoint.data_timeout() {
                Some(limit) => match time::timeout(limit, reader.read(buf)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data for {:?}", limit),
                    )),
                },
                None => reader.read(buf).await,
            };
            let fault = match outcome {
                Ok(n) if n > 0 => {
                    self.pos += n as u64;
                    self.last_fault_pos = None;
                    self.stats.record_read(n);
                    return Ok(n);
                }
                Ok(_) if self.pos >= self.status.len => return Ok(0),
                Ok(_) => Fault::EarlyEof,
                Err(e) if is_timeout(&e) => Fault::Timeout(e),
                Err(e) => {
                    self.fail().await;
                    return Err(FsError::from(e).with_path(&self.status.path));
                }
            };

            if self.last_fault_pos == Some(self.pos) {
                let path = self.status.path.clone();
                self.fail().await;
                return Err(FsError::retries_exhausted(&path, self.pos, fault)
                    .with_endpoint(&self.endpoint));
            }
            self.last_fault_pos = Some(self.pos);
            warn!(
                "RemoteFS read {} at offset {}: {}; reconnecting",
                self.status.path, self.pos, fault
            );
            if !self.reconnect().await? {
                return Ok(0);
            }
        }
    }

    /// Single byte, `None` at end of file.
    pub async fn read_byte(&mut self) -> FsResult<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> FsResult<usize> {
        let mut chunk = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(total),
                n => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
            }
        }
    }

    /// Replace the channel and reopen at the cursor. `Ok(false)` when the
    /// refreshed size says there is nothing left to read.
    async fn reconnect(&mut self) -> FsResult<bool> {
        self.keepalive = None;
        self.reader = None;
        if let Some(old) = self.channel.take() {
            self.pool.disconnect(old, true).await;
        }
        self.stats.record_reconnect();

        let channel = match self.pool.connect(&self.endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                self.state = StreamState::Failed;
                return Err(e);
            }
        };
        let fresh = match channel.stat(&self.status.path).await {
            Ok(status) => status,
            Err(e) => {
                self.pool.disconnect(channel, e.poisons_channel()).await;
                self.state = StreamState::Failed;
                return Err(e);
            }
        };
        if fresh.len != self.status.len {
            info!(
                "RemoteFS read {}: size changed {} -> {} while reading",
                self.status.path, self.status.len, fresh.len
            );
        }
        self.status = fresh;

        if self.pos >= self.status.len {
            self.channel = Some(channel);
            return Ok(false);
        }
        match channel.open_read(&self.status.path, self.pos).await {
            Ok(reader) => {
                debug!(
                    "RemoteFS read {}: resumed at offset {} on channel {}",
                    self.status.path,
                    self.pos,
                    channel.id()
                );
                self.reader = Some(reader);
                self.keepalive = KeepAlive::for_channel(&channel);
                self.channel = Some(channel);
                Ok(true)
            }
            Err(e) => {
                self.pool.disconnect(channel, true).await;
                self.state = StreamState::Failed;
                Err(e)
            }
        }
    }

    async fn fail(&mut self) {
        self.state = StreamState::Failed;
        self.keepalive = None;
        self.reader = None;
        if let Some(channel) = self.channel.take() {
            self.pool.disconnect(channel, true).await;
        }
    }

    /// Close the data stream and hand the channel back. Idempotent.
    pub async fn close(&mut self) -> FsResult<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.state = StreamState::Closed;
        self.keepalive = None;

        let closed = match self.reader.take() {
            Some(mut reader) => reader.close().await,
            None => Ok(()),
        };
        if let Some(channel) = self.channel.take() {
            match closed {
                Ok(()) => self.pool.disconnect(channel, false).await,
                Err(e) => {
                    debug!("RemoteFS read {}: close failed: {}", self.status.path, e);
                    self.pool.disconnect(channel, true).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remotefs::backend::memory::MemoryServer;
    use crate::remotefs::error::FsErrorKind;
    use async_trait::async_trait;
    use tokio::time::Duration;

    /// Serves `data` but breaks at `break_on`, optionally replacing the
    /// remote file first. The break is an early end of stream, or `fault`
    /// when set.
    struct BreakableReader {
        data: Vec<u8>,
        pos: usize,
        break_on: usize,
        broken: bool,
        fault: Option<io::ErrorKind>,
        rewrite: Option<(MemoryServer, String, Vec<u8>)>,
    }

    #[async_trait]
    impl DataReader for BreakableReader {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.broken && self.pos >= self.break_on {
                self.broken = true;
                if let Some((server, path, data)) = self.rewrite.take() {
                    server.put_file(&path, data).unwrap();
                }
                return match self.fault {
                    Some(kind) => Err(io::Error::new(kind, "scripted")),
                    None => Ok(0),
                };
            }
            if self.broken {
                return Ok(0);
            }
            let end = self.break_on.min(self.data.len()).min(self.pos + buf.len());
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(n)
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedReader {
        error: io::ErrorKind,
    }

    #[async_trait]
    impl DataReader for ScriptedReader {
        async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(self.error, "scripted"))
        }

        async fn close(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "close failed"))
        }
    }

    struct Fixture {
        server: MemoryServer,
        pool: ConnectionPool,
        endpoint: Arc<Endpoint>,
        stats: Arc<FsStatistics>,
    }

    fn fixture(keepalive_secs: Option<u64>) -> Fixture {
        let server = MemoryServer::new();
        let mut cfg = EndpointConfig::new(Protocol::Memory, "stream");
        if let Some(secs) = keepalive_secs {
            cfg.use_keepalive = true;
            cfg.keepalive_period_sec = secs;
        }
        let endpoint = server.endpoint(cfg).unwrap();
        Fixture {
            server,
            pool: ConnectionPool::with_max_connections(4),
            endpoint,
            stats: Arc::new(FsStatistics::new()),
        }
    }

    impl Fixture {
        async fn broken_stream(
            &self,
            initial: &[u8],
            break_on: usize,
            rewrite: Option<&[u8]>,
        ) -> ResilientReadStream {
            self.faulty_stream(initial, break_on, None, rewrite).await
        }

        async fn faulty_stream(
            &self,
            initial: &[u8],
            break_on: usize,
            fault: Option<io::ErrorKind>,
            rewrite: Option<&[u8]>,
        ) -> ResilientReadStream {
            self.server.put_file("/file", initial).unwrap();
            let channel = self.pool.connect(&self.endpoint).await.unwrap();
            let status = channel.stat(&RemotePath::parse("/file").unwrap()).await.unwrap();
            let reader = BreakableReader {
                data: initial.to_vec(),
                pos: 0,
                break_on,
                broken: false,
                fault,
                rewrite: rewrite.map(|d| (self.server.clone(), "/file".to_string(), d.to_vec())),
            };
            ResilientReadStream::with_reader(
                self.pool.clone(),
                channel,
                Box::new(reader),
                status,
                Arc::clone(&self.stats),
            )
        }

        async fn scripted_stream(&self, data: &[u8], error: io::ErrorKind) -> ResilientReadStream {
            self.server.put_file("/file", data).unwrap();
            let channel = self.pool.connect(&self.endpoint).await.unwrap();
            let status = channel.stat(&RemotePath::parse("/file").unwrap()).await.unwrap();
            ResilientReadStream::with_reader(
                self.pool.clone(),
                channel,
                Box::new(ScriptedReader { error }),
                status,
                Arc::clone(&self.stats),
            )
        }
    }

    async fn read_by_byte(stream: &mut ResilientReadStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = stream.read_byte().await.unwrap() {
            out.push(b);
        }
        out
    }

    #[tokio::test]
    async fn test_recovers_from_break_at_any_offset() {
        for break_on in [0, 2, 3] {
            let fx = fixture(None);
            let mut stream = fx.broken_stream(b"yaks", break_on, None).await;
            assert_eq!(read_by_byte(&mut stream).await, b"yaks");

            let mut stream = fx.broken_stream(b"yaks", break_on, None).await;
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"yaks", "break at {}", break_on);
            stream.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_recovers_from_timeout_at_any_offset() {
        for break_on in [0, 2, 3] {
            let fx = fixture(None);
            let mut stream = fx
                .faulty_stream(b"yaks", break_on, Some(io::ErrorKind::TimedOut), None)
                .await;
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"yaks", "timeout at {}", break_on);
            assert_eq!(fx.stats.snapshot().reconnects, 1);
            assert_eq!(fx.server.open_reads(), 1);
            assert_eq!(fx.server.sessions_closed(), 1);
            stream.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_growing_file_reads_new_length() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yaks", 2, Some(b"yakstaks")).await;
        assert_eq!(read_by_byte(&mut stream).await, b"yakstaks");
        assert_eq!(stream.status().len, 8);
        assert_eq!(fx.stats.snapshot().reconnects, 1);
    }

    #[tokio::test]
    async fn test_shrinking_file_truncates() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yakstaks", 2, Some(b"yaks")).await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"yaks");
    }

    #[tokio::test]
    async fn test_shrinking_below_cursor_ends_stream() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yakstaks", 6, Some(b"ya")).await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"yaksta");
        assert_eq!(stream.read_byte().await.unwrap(), None);
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[tokio::test]
    async fn test_timeout_triggers_reconnect() {
        let fx = fixture(None);
        let mut stream = fx.scripted_stream(b"yaks", io::ErrorKind::TimedOut).await;
        assert_eq!(read_by_byte(&mut stream).await, b"yaks");
        assert_eq!(fx.server.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_second_fault_at_same_offset_fails() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yaks", 2, None).await;
        fx.server.fail_next_reads(1, io::ErrorKind::TimedOut);

        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind, FsErrorKind::RetriesExhausted);
        assert_eq!(out, b"ya");
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(stream.read_byte().await.is_err());
        assert_eq!(fx.pool.stats(&fx.endpoint).checked_out, 0);
    }

    #[tokio::test]
    async fn test_plain_io_error_propagates() {
        let fx = fixture(None);
        let mut stream = fx.scripted_stream(b"yaks", io::ErrorKind::Other).await;
        let err = stream.read_byte().await.unwrap_err();
        assert_eq!(err.kind, FsErrorKind::IoError);
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(fx.stats.snapshot().reconnects, 0);
    }

    #[tokio::test]
    async fn test_close_returns_channel_and_is_idempotent() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yaks", 4, None).await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap_err().kind, FsErrorKind::StreamClosed);

        let stats = fx.pool.stats(&fx.endpoint);
        assert_eq!((stats.idle, stats.checked_out), (1, 0));
        assert_eq!(fx.stats.snapshot().bytes_read, 4);
    }

    #[tokio::test]
    async fn test_failed_close_destroys_channel() {
        let fx = fixture(None);
        let mut stream = fx.scripted_stream(b"yaks", io::ErrorKind::TimedOut).await;
        stream.close().await.unwrap();
        assert_eq!(fx.pool.stats(&fx.endpoint).idle, 0);
        assert_eq!(fx.server.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_seek_unsupported() {
        let fx = fixture(None);
        let mut stream = fx.broken_stream(b"yaks", 4, None).await;
        assert_eq!(stream.seek(2).unwrap_err().kind, FsErrorKind::Unsupported);
    }

    /// Data stream that trickles one byte every 400ms.
    struct SlowReader {
        data: Vec<u8>,
        pos: usize,
    }

    #[async_trait]
    impl DataReader for SlowReader {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            time::sleep(Duration::from_millis(400)).await;
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn slow_stream(fx: &Fixture, data: &[u8]) -> ResilientReadStream {
        fx.server.put_file("/slow", data).unwrap();
        let channel = fx.pool.connect(&fx.endpoint).await.unwrap();
        let status = channel.stat(&RemotePath::parse("/slow").unwrap()).await.unwrap();
        let reader = SlowReader {
            data: data.to_vec(),
            pos: 0,
        };
        ResilientReadStream::with_reader(
            fx.pool.clone(),
            channel,
            Box::new(reader),
            status,
            Arc::clone(&fx.stats),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fires_during_long_read() {
        let fx = fixture(Some(1));
        let mut stream = slow_stream(&fx, b"yakstaks").await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"yakstaks");
        assert!(fx.server.noop_calls() >= 2);
        stream.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_keepalive_for_short_read() {
        let fx = fixture(Some(1));
        let mut stream = slow_stream(&fx, b"y").await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        stream.close().await.unwrap();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.server.noop_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_data_timeout_never_times_out() {
        let server = MemoryServer::new();
        let mut cfg = EndpointConfig::new(Protocol::Memory, "patient");
        cfg.data_timeout_sec = 0;
        let fx = Fixture {
            endpoint: server.endpoint(cfg).unwrap(),
            server,
            pool: ConnectionPool::with_max_connections(2),
            stats: Arc::new(FsStatistics::new()),
        };
        let mut stream = slow_stream(&fx, b"yaks").await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"yaks");
        assert_eq!(fx.stats.snapshot().reconnects, 0);
        assert_eq!(fx.server.sessions_closed(), 0);
        stream.close().await.unwrap();
        assert_eq!(fx.pool.stats(&fx.endpoint).idle, 1);
    }

    /// Data stream that never delivers anything.
    struct StalledReader;

    #[async_trait]
    impl DataReader for StalledReader {
        async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            futures::future::pending().await
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_data_stream_times_out_and_resumes() {
        let server = MemoryServer::new();
        let mut cfg = EndpointConfig::new(Protocol::Memory, "stall");
        cfg.data_timeout_sec = 2;
        let endpoint = server.endpoint(cfg).unwrap();
        let pool = ConnectionPool::with_max_connections(2);
        let stats = Arc::new(FsStatistics::new());

        server.put_file("/stall", b"yaks").unwrap();
        let channel = pool.connect(&endpoint).await.unwrap();
        let status = channel.stat(&RemotePath::parse("/stall").unwrap()).await.unwrap();
        let mut stream = ResilientReadStream::with_reader(
            pool.clone(),
            channel,
            Box::new(StalledReader),
            status,
            Arc::clone(&stats),
        );

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"yaks");
        assert_eq!(stats.snapshot().reconnects, 1);
        stream.close().await.unwrap();
    }
}

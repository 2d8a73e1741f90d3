//! Immutable description of one remote target plus the factory that opens
//! sessions to it. Endpoint equality is the connection pool's lookup key.

use crate::remotefs::channel::RemoteSession;
use crate::remotefs::error::{FsError, FsResult};
use crate::remotefs::types::*;
use futures::future::BoxFuture;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Future returned by a [`Connector`].
pub type SessionFuture = BoxFuture<'static, FsResult<Arc<dyn RemoteSession>>>;

/// Opens an authenticated session to the given endpoint.
pub type Connector = Arc<dyn Fn(Arc<Endpoint>) -> SessionFuture + Send + Sync>;

pub struct Endpoint {
    protocol: Protocol,
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    private_key_path: Option<String>,
    private_key_passphrase: Option<String>,
    proxy: ProxyConfig,
    max_connections: usize,
    keepalive: Option<Duration>,
    cache_directories: bool,
    connect_timeout: Option<Duration>,
    data_timeout: Option<Duration>,
    connector: Connector,
}

impl Endpoint {
    /// Validate `config` and bind it to `connector`.
    pub fn from_config(config: EndpointConfig, connector: Connector) -> FsResult<Arc<Self>> {
        let host = config.host.trim().to_lowercase();
        if host.is_empty() {
            return Err(FsError::invalid_config("Invalid host specified"));
        }
        let user = config.user.filter(|u| !u.is_empty());
        if user.is_none() && config.protocol.requires_user() {
            return Err(FsError::invalid_config(format!(
                "No user specified for {}://{}",
                config.protocol, host
            )));
        }
        if config.proxy.kind != ProxyKind::None && config.proxy.host.is_none() {
            return Err(FsError::invalid_config("Proxy type set but no proxy host given"));
        }
        if config.max_connections == 0 {
            return Err(FsError::invalid_config("maxConnections must be at least 1"));
        }

        let keepalive = if config.use_keepalive {
            Some(Duration::from_secs(config.keepalive_period_sec.max(1)))
        } else {
            None
        };

        Ok(Arc::new(Self {
            protocol: config.protocol,
            port: config.port.unwrap_or_else(|| config.protocol.default_port()),
            host,
            user,
            password: config.password,
            private_key_path: config.private_key_path,
            private_key_passphrase: config.private_key_passphrase,
            proxy: config.proxy,
            max_connections: config.max_connections,
            keepalive,
            cache_directories: config.cache_directories,
            connect_timeout: non_zero_secs(config.connect_timeout_sec),
            data_timeout: non_zero_secs(config.data_timeout_sec),
            connector,
        }))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn private_key_path(&self) -> Option<&str> {
        self.private_key_path.as_deref()
    }

    pub fn private_key_passphrase(&self) -> Option<&str> {
        self.private_key_passphrase.as_deref()
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Keep-alive period, `None` when disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn cache_directories(&self) -> bool {
        self.cache_directories
    }

    /// `None` when configured as 0: wait as long as the server takes.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// `None` when configured as 0: reads never time out.
    pub fn data_timeout(&self) -> Option<Duration> {
        self.data_timeout
    }

    /// Run the connector, bounded by the connect timeout if there is one.
    pub async fn open_session(self: &Arc<Self>) -> FsResult<Arc<dyn RemoteSession>> {
        let fut = (self.connector)(Arc::clone(self));
        let Some(limit) = self.connect_timeout else {
            return fut.await.map_err(|e| e.with_endpoint(self));
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(e.with_endpoint(self)),
            Err(_) => Err(FsError::timeout(format!(
                "Connecting took longer than {:?}",
                limit
            ))
            .with_endpoint(self)),
        }
    }

    #[allow(clippy::type_complexity)]
    fn identity(
        &self,
    ) -> (
        Protocol,
        &str,
        u16,
        Option<&str>,
        (ProxyKind, Option<&str>, Option<u16>, Option<&str>),
        usize,
        Option<Duration>,
        bool,
        Option<Duration>,
        Option<Duration>,
    ) {
        (
            self.protocol,
            &self.host,
            self.port,
            self.user.as_deref(),
            (
                self.proxy.kind,
                self.proxy.host.as_deref(),
                self.proxy.effective_port(),
                self.proxy.user.as_deref(),
            ),
            self.max_connections,
            self.keepalive,
            self.cache_directories,
            self.connect_timeout,
            self.data_timeout,
        )
    }
}

// Secrets and the connector never take part in identity.
impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("proxy", &self.proxy.kind)
            .field("max_connections", &self.max_connections)
            .field("keepalive", &self.keepalive)
            .field("cache_directories", &self.cache_directories)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remotefs::backend::memory::MemoryServer;

    fn config(host: &str) -> EndpointConfig {
        let mut cfg = EndpointConfig::new(Protocol::Ftp, host);
        cfg.user = Some("alice".into());
        cfg
    }

    #[test]
    fn test_defaults_applied() {
        let server = MemoryServer::new();
        let ep = Endpoint::from_config(config("Files.Example.com"), server.connector()).unwrap();
        assert_eq!(ep.host(), "files.example.com");
        assert_eq!(ep.port(), 21);
        assert_eq!(ep.max_connections(), 5);
        assert_eq!(ep.keepalive(), None);
        assert!(!ep.cache_directories());
        assert_eq!(ep.to_string(), "alice@files.example.com:21");
    }

    #[test]
    fn test_validation() {
        let server = MemoryServer::new();
        let err = Endpoint::from_config(config("  "), server.connector()).unwrap_err();
        assert_eq!(err.kind, crate::remotefs::FsErrorKind::InvalidConfig);

        let mut no_user = config("h");
        no_user.user = None;
        assert!(Endpoint::from_config(no_user, server.connector()).is_err());

        let mut bad_proxy = config("h");
        bad_proxy.proxy.kind = ProxyKind::Socks5;
        assert!(Endpoint::from_config(bad_proxy, server.connector()).is_err());
    }

    #[test]
    fn test_identity_ignores_secrets_and_connector() {
        let a = MemoryServer::new();
        let b = MemoryServer::new();
        let mut with_pw = config("h");
        with_pw.password = Some("one".into());
        let mut other_pw = config("h");
        other_pw.password = Some("two".into());

        let ep1 = Endpoint::from_config(with_pw, a.connector()).unwrap();
        let ep2 = Endpoint::from_config(other_pw, b.connector()).unwrap();
        assert_eq!(*ep1, *ep2);

        let mut other_port = config("h");
        other_port.port = Some(2121);
        let ep3 = Endpoint::from_config(other_port, a.connector()).unwrap();
        assert_ne!(*ep1, *ep3);

        let mut other_user = config("h");
        other_user.user = Some("bob".into());
        let ep4 = Endpoint::from_config(other_user, a.connector()).unwrap();
        assert_ne!(*ep1, *ep4);
    }

    fn slow_connector(server: &MemoryServer, delay: Duration) -> Connector {
        let inner = server.connector();
        Arc::new(move |ep: Arc<Endpoint>| -> SessionFuture {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                inner(ep).await
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeouts_mean_wait_forever() {
        let server = MemoryServer::new();
        let mut cfg = config("h");
        cfg.connect_timeout_sec = 0;
        cfg.data_timeout_sec = 0;
        let ep = Endpoint::from_config(cfg, slow_connector(&server, Duration::from_secs(600))).unwrap();
        assert_eq!(ep.connect_timeout(), None);
        assert_eq!(ep.data_timeout(), None);
        assert!(ep.open_session().await.is_ok());
        assert_eq!(server.sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_times_out() {
        let server = MemoryServer::new();
        let mut cfg = config("h");
        cfg.connect_timeout_sec = 5;
        let ep = Endpoint::from_config(cfg, slow_connector(&server, Duration::from_secs(600))).unwrap();
        assert_eq!(ep.connect_timeout(), Some(Duration::from_secs(5)));
        let err = ep.open_session().await.err().unwrap();
        assert_eq!(err.kind, crate::remotefs::FsErrorKind::Timeout);
        assert_eq!(server.sessions_opened(), 0);
    }
}

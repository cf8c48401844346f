//! Dynamic TLS listener.
//!
//! [`DynamicListener`] wraps a plain [`Listener`] and terminates TLS with a
//! certificate that grows to cover every identity clients reach it by:
//!
//! - local IPv4 addresses of accepted connections (opportunistic, errors
//!   are logged)
//! - SNI server names (synchronous, errors fail the handshake)
//! - IP `Host` headers seen by the [`CacheHandler`]
//!
//! The serving record lives in a [`TlsStorage`]; the parsed certificate is
//! cached per record version and re-parsed only when the version changes.
//! A background sweep renews the certificate before it expires.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dynlistener_cert::{is_cert_expired, parse_cert_pem, parse_certs_pem, CaKeypair};
use http::header::{HOST, USER_AGENT};
use http::{Request, Response};
use http_body_util::Full;
use parking_lot::Mutex;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OnceCell, RwLock};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conn::{ConnHandle, ConnTable, ListenerConn};
use crate::error::ListenerError;
use crate::factory::{allow_default_sans, needs_update, CertFactory, FilterFn, TlsFactory};
use crate::known_ips::KnownIps;
use crate::metrics::ListenerMetrics;
use crate::secret::TlsSecret;
use crate::storage::{NonNil, TlsStorage};

/// Default serving certificate common name and organization
pub const DEFAULT_CN: &str = "dynamic";
/// Default renewal window in days
pub const DEFAULT_EXPIRATION_DAYS_CHECK: u32 = 30;

/// Interval between expiration checks
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Interval after a failed expiration check
const SWEEP_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A stream connection accepted by a [`Listener`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// A source of plain stream connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Conn: Connection;

    async fn accept(&self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Callback deciding at startup whether to regenerate the record.
pub type RegenerateFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Settings for a [`DynamicListener`].
#[derive(Clone, Default)]
pub struct ListenerConfig {
    /// Leaf common name; defaults to `dynamic`
    pub common_name: String,
    /// Leaf organizations; defaults to `["dynamic"]`
    pub organization: Vec<String>,
    /// Base TLS settings; the certificate resolver is replaced
    pub tls_config: Option<Arc<ServerConfig>>,
    /// Names always on the certificate
    pub sans: Vec<String>,
    /// SAN cap, 0 = unlimited
    pub max_sans: usize,
    /// Renewal window in days; defaults to 30
    pub expiration_days_check: u32,
    /// Close ready connections when the certificate changes
    pub close_conn_on_cert_change: bool,
    pub regenerate_certs: Option<RegenerateFn>,
    pub filter_cn: Option<FilterFn>,
    /// Counters to record into; unregistered ones are created otherwise
    pub metrics: Option<ListenerMetrics>,
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("common_name", &self.common_name)
            .field("organization", &self.organization)
            .field("sans", &self.sans)
            .field("max_sans", &self.max_sans)
            .field("expiration_days_check", &self.expiration_days_check)
            .field("close_conn_on_cert_change", &self.close_conn_on_cert_change)
            .field("filter_cn", &self.filter_cn.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolver presenting one fixed certificate.
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Resolver for the base config before any certificate is loaded.
#[derive(Debug)]
struct NoCert;

impl ResolvesServerCert for NoCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// A parsed serving certificate and the TLS config presenting it.
struct LoadedCert {
    fingerprint: String,
    server_config: Arc<ServerConfig>,
}

#[derive(Default)]
struct CertState {
    cert: Option<Arc<LoadedCert>>,
    version: String,
}

impl CertState {
    fn current(&self, secret: &TlsSecret) -> Option<Arc<LoadedCert>> {
        let token = secret.version_token();
        match &self.cert {
            Some(cert) if !token.is_empty() && self.version == token => Some(cert.clone()),
            _ => None,
        }
    }
}

struct Inner {
    factory: Arc<dyn TlsFactory>,
    storage: NonNil,
    sans: Vec<String>,
    max_sans: usize,
    base_config: Arc<ServerConfig>,
    state: RwLock<CertState>,
    conns: Option<Arc<ConnTable>>,
    known_ips: Mutex<KnownIps>,
    metrics: ListenerMetrics,
    loaded: watch::Sender<bool>,
    preload: OnceCell<()>,
}

/// TLS listener generating and rotating its certificate on demand.
pub struct DynamicListener<L: Listener> {
    listener: L,
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl<L: Listener> DynamicListener<L> {
    /// Wrap `listener`; returns the listener and the Host-observing handler.
    pub async fn new(
        listener: L,
        storage: Arc<dyn TlsStorage>,
        ca: Arc<CaKeypair>,
        config: ListenerConfig,
    ) -> Result<(Self, CacheHandler), ListenerError> {
        let common_name = if config.common_name.is_empty() {
            DEFAULT_CN.to_string()
        } else {
            config.common_name
        };
        let organization = if config.organization.is_empty() {
            vec![DEFAULT_CN.to_string()]
        } else {
            config.organization
        };
        let expiration_days_check = if config.expiration_days_check == 0 {
            DEFAULT_EXPIRATION_DAYS_CHECK
        } else {
            config.expiration_days_check
        };

        let factory: Arc<dyn TlsFactory> = Arc::new(
            CertFactory::new(ca, common_name, organization)
                .with_filter(allow_default_sans(&config.sans, config.filter_cn))
                .with_max_sans(config.max_sans),
        );
        storage.set_factory(factory.clone());

        let mut base_config = match config.tls_config {
            Some(tls_config) => (*tls_config).clone(),
            None => default_server_config()?,
        };
        if config.close_conn_on_cert_change && base_config.alpn_protocols.is_empty() {
            base_config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        }

        let metrics = match config.metrics {
            Some(metrics) => metrics,
            None => ListenerMetrics::new()?,
        };
        let (loaded, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            factory,
            storage: NonNil::new(storage),
            sans: config.sans,
            max_sans: config.max_sans,
            base_config: Arc::new(base_config),
            state: RwLock::new(CertState::default()),
            conns: config
                .close_conn_on_cert_change
                .then(|| Arc::new(ConnTable::new())),
            known_ips: Mutex::new(KnownIps::new()),
            metrics,
            loaded,
            preload: OnceCell::new(),
        });

        if let Some(regenerate) = &config.regenerate_certs {
            if regenerate() {
                inner.regenerate_certs().await?;
            }
        }

        let cancel = CancellationToken::new();
        spawn_expiration_sweep(inner.clone(), expiration_days_check, cancel.clone());

        let handler = CacheHandler {
            inner: inner.clone(),
        };
        Ok((
            Self {
                listener,
                inner,
                cancel,
            },
            handler,
        ))
    }

    /// Accept the next connection; the TLS handshake runs in
    /// [`Accepted::handshake`].
    pub async fn accept(&self) -> Result<Accepted<L::Conn>, ListenerError> {
        self.inner.preload().await;

        let conn = self.listener.accept().await.map_err(ListenerError::Accept)?;

        match conn.local_addr() {
            Ok(addr) => {
                let ip = addr.ip().to_canonical();
                if ip.is_ipv4() {
                    self.inner.known_ips.lock().observe(ip);
                    if let Err(e) = self.inner.update_cert(&[ip.to_string()]).await {
                        warn!(address = %ip, error = %e, "Failed to update certificate with listener address");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read local address of accepted connection");
            }
        }

        Ok(Accepted {
            conn: ListenerConn::new(conn, self.inner.conns.as_ref()),
            inner: self.inner.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn get_ref(&self) -> &L {
        &self.listener
    }

    /// Counters this listener records into.
    pub fn metrics(&self) -> &ListenerMetrics {
        &self.inner.metrics
    }

    /// Number of connections currently tracked for invalidation.
    pub fn tracked_connections(&self) -> usize {
        self.inner.conns.as_ref().map_or(0, |conns| conns.len())
    }

    /// Stop the expiration sweep.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl<L: Listener> Drop for DynamicListener<L> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A connection accepted but not yet through its TLS handshake.
pub struct Accepted<C: Connection> {
    conn: ListenerConn<C>,
    inner: Arc<Inner>,
}

impl<C: Connection> Accepted<C> {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Run the TLS handshake, expanding the certificate for the client's SNI.
    pub async fn handshake(self) -> Result<TlsStream<ListenerConn<C>>, ListenerError> {
        let inner = self.inner;
        let result = inner.handshake(self.conn).await;
        if let Err(e) = &result {
            inner.metrics.handshake_failures.inc();
            debug!(error = %e, "TLS handshake failed");
        }
        result
    }
}

impl Inner {
    async fn preload(&self) {
        self.preload
            .get_or_init(|| async {
                if self.sans.is_empty() {
                    return;
                }
                if let Err(e) = self.update_cert(&self.sans).await {
                    error!(error = %e, "Failed to update certificate with configured SANs");
                    return;
                }
                if let Err(e) = self.load_cert(None).await {
                    error!(error = %e, "Failed to preload certificate");
                }
            })
            .await;
    }

    async fn handshake<C: Connection>(
        &self,
        conn: ListenerConn<C>,
    ) -> Result<TlsStream<ListenerConn<C>>, ListenerError> {
        let handle = conn.handle().cloned();
        let start = LazyConfigAcceptor::new(Acceptor::default(), conn)
            .await
            .map_err(ListenerError::Handshake)?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        match &server_name {
            Some(name) => {
                if let Err(e) = self.update_cert(std::slice::from_ref(name)).await {
                    error!(server_name = %name, error = %e, "Failed to update certificate with TLS server name");
                    return Err(e);
                }
            }
            None => self.sync_known_ips().await,
        }

        let loaded = self.load_cert(handle.as_ref()).await?;
        let stream = start
            .into_stream(loaded.server_config.clone())
            .await
            .map_err(ListenerError::Handshake)?;

        if let Some(handle) = &handle {
            handle.mark_ready();
        }
        Ok(stream)
    }

    /// Add the known local IP group if it changed since the last sync.
    async fn sync_known_ips(&self) {
        let Some((key, names)) = self.known_ips.lock().pending() else {
            return;
        };

        match self.update_cert(&names).await {
            Ok(()) => self.known_ips.lock().mark_synced(key),
            Err(e) => warn!(group = %key, error = %e, "Failed to update certificate with known IPs"),
        }
    }

    async fn observe_host_ip(&self, ip: IpAddr) {
        self.known_ips.lock().observe(ip);
        if let Err(e) = self.update_cert(&[ip.to_string()]).await {
            warn!(address = %ip, error = %e, "Failed to update certificate with HTTP request Host header");
        }
    }

    async fn update_cert(&self, names: &[String]) -> Result<(), ListenerError> {
        let names = self.factory.filter(names);
        if names.is_empty() {
            return Ok(());
        }

        {
            let _state = self.state.read().await;
            let secret = self.storage.load().await?;
            if secret.is_static() || !needs_update(self.max_sans, &secret, &names) {
                return Ok(());
            }
        }

        let mut state = self.state.write().await;
        let secret = self.storage.load().await?;
        if secret.is_static() || !needs_update(self.max_sans, &secret, &names) {
            return Ok(());
        }

        let mut all = self.sans.clone();
        all.extend(names.iter().cloned());
        let (secret, updated) = self.factory.add_cn(&secret, &all)?;
        if updated {
            self.storage.store(&secret).await?;
            state.version.clear();
            self.metrics.certificate_updates.inc();
            info!(names = ?names, "Updated serving certificate");
        }
        Ok(())
    }

    async fn load_cert(
        &self,
        current: Option<&Arc<ConnHandle>>,
    ) -> Result<Arc<LoadedCert>, ListenerError> {
        {
            let state = self.state.read().await;
            let secret = self.storage.load().await?;
            if let Some(cert) = state.current(&secret) {
                return Ok(cert);
            }
        }

        let mut state = self.state.write().await;
        let mut secret = self.storage.load().await?;
        if let Some(cert) = state.current(&secret) {
            return Ok(cert);
        }

        if secret.cert_pem().is_empty() && !secret.is_static() {
            let (generated, updated) = self.factory.add_cn(&secret, &self.sans)?;
            secret = if updated {
                self.metrics.certificate_updates.inc();
                self.storage.store(&generated).await?
            } else {
                generated
            };
        }

        let loaded = Arc::new(self.build_cert(&secret)?);
        self.metrics.certificate_loads.inc();

        if let (Some(conns), Some(current), Some(previous)) = (&self.conns, current, &state.cert) {
            if previous.fingerprint != loaded.fingerprint {
                let closed = conns.close_ready_except(Some(current.id()));
                if closed > 0 {
                    self.metrics.connections_closed.inc_by(closed as u64);
                    info!(closed, "Closed connections after certificate change");
                }
            }
        }

        debug!(
            version = %secret.version_token(),
            fingerprint = %loaded.fingerprint,
            "Loaded serving certificate"
        );
        state.cert = Some(loaded.clone());
        state.version = secret.version_token();
        self.loaded.send_replace(true);
        Ok(loaded)
    }

    fn build_cert(&self, secret: &TlsSecret) -> Result<LoadedCert, ListenerError> {
        let certs = parse_certs_pem(secret.cert_pem())?;
        let fingerprint = certs.first().map(|leaf| leaf.fingerprint()).unwrap_or_default();
        let chain: Vec<_> = certs.into_iter().map(|cert| cert.der().clone()).collect();

        let key_der = rustls_pemfile::private_key(&mut secret.key_pem())
            .map_err(|e| ListenerError::InvalidCert(format!("failed to read private key: {e}")))?
            .ok_or_else(|| ListenerError::InvalidCert("no private key in record".to_string()))?;
        let signing_key = self
            .base_config
            .crypto_provider()
            .key_provider
            .load_private_key(key_der)?;

        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        let mut server_config = (*self.base_config).clone();
        server_config.cert_resolver = Arc::new(FixedCert(certified));

        Ok(LoadedCert {
            fingerprint,
            server_config: Arc::new(server_config),
        })
    }

    async fn regenerate_certs(&self) -> Result<(), ListenerError> {
        let mut state = self.state.write().await;
        let secret = self.storage.load().await?;
        let regenerated = self.factory.regenerate(&secret)?;
        self.storage.store(&regenerated).await?;
        state.version.clear();
        info!("Regenerated serving certificate");
        Ok(())
    }

    async fn check_expiration(&self, days: u32) -> Result<(), ListenerError> {
        if days == 0 {
            return Ok(());
        }

        let mut state = self.state.write().await;
        if state.cert.is_none() {
            return Ok(());
        }

        let secret = self.storage.load().await?;
        let leaf = parse_cert_pem(secret.cert_pem())?;
        if !is_cert_expired(&leaf, days)? {
            return Ok(());
        }

        let renewed = self.factory.renew(&secret)?;
        self.storage.store(&renewed).await?;
        state.version.clear();
        self.metrics.certificate_renewals.inc();
        info!(days, "Renewed serving certificate");
        Ok(())
    }
}

fn default_server_config() -> Result<ServerConfig, ListenerError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Ok(ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(NoCert)))
}

fn spawn_expiration_sweep(inner: Arc<Inner>, days: u32, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut loaded = inner.loaded.subscribe();
        let ready = tokio::select! {
            _ = cancel.cancelled() => false,
            ok = async { loaded.wait_for(|ready| *ready).await.is_ok() } => ok,
        };
        if !ready {
            return;
        }

        loop {
            let wait = match inner.check_expiration(days).await {
                Ok(()) => SWEEP_INTERVAL,
                Err(e) if e.is_static_cert() => {
                    error!(error = %e, "Serving certificate is static and about to expire");
                    SWEEP_INTERVAL
                }
                Err(e) => {
                    error!(error = %e, "Failed to check and renew serving certificate");
                    SWEEP_RETRY_INTERVAL
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    });
}

/// Records IP `Host` headers of plain HTTP requests as SANs.
///
/// Requests from browsers (a `mozilla` User-Agent) are ignored.
#[derive(Clone)]
pub struct CacheHandler {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandler").finish_non_exhaustive()
    }
}

impl CacheHandler {
    /// Observe a request. The returned future does not borrow the request.
    pub fn observe<B>(&self, req: &Request<B>) -> impl Future<Output = ()> + Send + 'static {
        let ip = observable_host_ip(req);
        let inner = self.inner.clone();
        async move {
            if let Some(ip) = ip {
                inner.observe_host_ip(ip).await;
            }
        }
    }
}

fn observable_host_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    let ip = parse_host_ip(host)?;

    let from_browser = req
        .headers()
        .get_all(USER_AGENT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|ua| ua.to_ascii_lowercase().contains("mozilla"));
    (!from_browser).then_some(ip)
}

/// IP of a `host[:port]` string, accepting bracketed IPv6.
pub(crate) fn parse_host_ip(host: &str) -> Option<IpAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

impl<B: Send + 'static> tower::Service<Request<B>> for CacheHandler {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let observe = self.observe(&req);
        Box::pin(async move {
            observe.await;
            Ok(Response::new(Full::new(Bytes::new())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::cns;
    use crate::storage::MemoryStorage;
    use tower::ServiceExt;

    async fn setup_listener(
        config: ListenerConfig,
    ) -> (DynamicListener<TcpListener>, CacheHandler, Arc<MemoryStorage>) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let ca = Arc::new(CaKeypair::generate("test-ca", "test-org").unwrap());
        let (listener, handler) = DynamicListener::new(tcp, storage.clone(), ca, config)
            .await
            .unwrap();
        (listener, handler, storage)
    }

    async fn stored(storage: &MemoryStorage) -> TlsSecret {
        storage.get().await.unwrap().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_update_cert_adds_configured_sans() {
        let config = ListenerConfig {
            sans: vec!["localhost".to_string()],
            ..Default::default()
        };
        let (listener, _handler, storage) = setup_listener(config).await;

        listener
            .inner
            .update_cert(&["svc.example".to_string()])
            .await
            .unwrap();

        let secret = stored(&storage).await;
        assert_eq!(cns(&secret), vec!["localhost", "svc.example"]);
        assert_eq!(listener.metrics().certificate_updates.get(), 1);

        listener
            .inner
            .update_cert(&["svc.example".to_string()])
            .await
            .unwrap();
        assert_eq!(listener.metrics().certificate_updates.get(), 1);
    }

    #[tokio::test]
    async fn test_load_cert_caches_by_version() {
        let (listener, _handler, _storage) = setup_listener(ListenerConfig::default()).await;

        let first = listener.inner.load_cert(None).await.unwrap();
        let second = listener.inner.load_cert(None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(listener.metrics().certificate_loads.get(), 1);

        listener
            .inner
            .update_cert(&["new.example".to_string()])
            .await
            .unwrap();
        let third = listener.inner.load_cert(None).await.unwrap();
        assert_ne!(third.fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn test_shared_storage_serves_stored_cert() {
        let storage = Arc::new(MemoryStorage::new());
        let ca = Arc::new(CaKeypair::generate("test-ca", "test-org").unwrap());
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (a, _) = DynamicListener::new(tcp, storage.clone(), ca.clone(), ListenerConfig::default())
            .await
            .unwrap();
        a.inner.load_cert(None).await.unwrap();

        let mut seeded = stored(&storage).await;
        seeded.metadata.resource_version = "7".to_string();
        storage.update(&seeded).await.unwrap();
        a.inner.load_cert(None).await.unwrap();

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (b, _) = DynamicListener::new(tcp, storage.clone(), ca, ListenerConfig::default())
            .await
            .unwrap();
        b.inner.update_cert(&["b.example".to_string()]).await.unwrap();

        a.inner.update_cert(&["b.example".to_string()]).await.unwrap();
        let served = a.inner.load_cert(None).await.unwrap();

        let secret = stored(&storage).await;
        assert_eq!(secret.metadata.resource_version, "7");
        assert_eq!(cns(&secret), vec!["b.example"]);
        assert_eq!(Some(served.fingerprint.as_str()), secret.fingerprint());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_every_name() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let inner = listener.inner.clone();
                tokio::spawn(async move {
                    inner.update_cert(&[format!("n{i}.example")]).await.unwrap();
                    inner.load_cert(None).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let names = cns(&stored(&storage).await);
        assert_eq!(names.len(), 16);
        for i in 0..16 {
            assert!(names.contains(&format!("n{i}.example")), "missing n{i}.example");
        }

        let served = listener.inner.load_cert(None).await.unwrap();
        assert_eq!(Some(served.fingerprint.as_str()), stored(&storage).await.fingerprint());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_parse_once() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;
        listener
            .inner
            .update_cert(&["svc.example".to_string()])
            .await
            .unwrap();
        let before = stored(&storage).await;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let inner = listener.inner.clone();
                tokio::spawn(async move { inner.load_cert(None).await.unwrap() })
            })
            .collect();
        let mut fingerprints = Vec::new();
        for task in tasks {
            fingerprints.push(task.await.unwrap().fingerprint.clone());
        }

        assert_eq!(listener.metrics().certificate_loads.get(), 1);
        assert!(fingerprints.iter().all(|f| Some(f.as_str()) == before.fingerprint()));
        assert_eq!(stored(&storage).await, before);
    }

    #[tokio::test]
    async fn test_default_identity() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;
        listener.inner.load_cert(None).await.unwrap();

        let secret = stored(&storage).await;
        let info = parse_cert_pem(secret.cert_pem()).unwrap().info().unwrap();
        assert_eq!(info.common_name.as_deref(), Some("dynamic"));
        assert_eq!(info.organizations, vec!["dynamic".to_string()]);
    }

    #[tokio::test]
    async fn test_static_record_never_updated() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;
        listener.inner.load_cert(None).await.unwrap();

        let mut secret = stored(&storage).await;
        secret.annotations_mut().insert(
            crate::secret::STATIC_ANNOTATION.to_string(),
            "true".to_string(),
        );
        storage.update(&secret).await.unwrap();

        listener
            .inner
            .update_cert(&["other.example".to_string()])
            .await
            .unwrap();
        assert_eq!(stored(&storage).await, secret);
    }

    #[tokio::test]
    async fn test_check_expiration_renews() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;
        listener.inner.load_cert(None).await.unwrap();
        let before = stored(&storage).await;

        // Not within 30 days of expiry
        listener.inner.check_expiration(30).await.unwrap();
        assert_eq!(stored(&storage).await, before);

        // Every certificate expires within 100k days
        listener.inner.check_expiration(100_000).await.unwrap();
        let after = stored(&storage).await;
        assert_ne!(after.fingerprint(), before.fingerprint());
        assert_eq!(after.key_pem(), before.key_pem());
        assert_eq!(listener.metrics().certificate_renewals.get(), 1);
    }

    #[tokio::test]
    async fn test_check_expiration_static_error() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;
        listener.inner.load_cert(None).await.unwrap();

        let mut secret = stored(&storage).await;
        secret.annotations_mut().insert(
            crate::secret::STATIC_ANNOTATION.to_string(),
            "true".to_string(),
        );
        storage.update(&secret).await.unwrap();

        let err = listener.inner.check_expiration(100_000).await.unwrap_err();
        assert!(err.is_static_cert());
    }

    #[tokio::test]
    async fn test_check_expiration_skips_before_load() {
        let (listener, _handler, storage) = setup_listener(ListenerConfig::default()).await;

        listener.inner.check_expiration(100_000).await.unwrap();
        assert_eq!(storage.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_regenerate_on_startup() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let ca = Arc::new(CaKeypair::generate("test-ca", "test-org").unwrap());

        let (first, _) = DynamicListener::new(tcp, storage.clone(), ca.clone(), ListenerConfig::default())
            .await
            .unwrap();
        first.inner.update_cert(&["a.example".to_string()]).await.unwrap();
        let before = stored(&storage).await;
        drop(first);

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ListenerConfig {
            regenerate_certs: Some(Arc::new(|| true)),
            ..Default::default()
        };
        let (_second, _) = DynamicListener::new(tcp, storage.clone(), ca, config)
            .await
            .unwrap();

        let after = stored(&storage).await;
        assert_ne!(after.key_pem(), before.key_pem());
        assert_eq!(cns(&after), vec!["a.example"]);
    }

    #[tokio::test]
    async fn test_cache_handler_records_ip_host() {
        let (listener, handler, storage) = setup_listener(ListenerConfig::default()).await;

        let req = Request::builder()
            .uri("/")
            .header(HOST, "10.1.2.3:8443")
            .body(())
            .unwrap();
        let resp = handler.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);

        let secret = stored(&storage).await;
        assert_eq!(cns(&secret), vec!["10.1.2.3"]);
        assert_eq!(listener.inner.known_ips.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_handler_ignores_browsers_and_names() {
        let (_listener, handler, storage) = setup_listener(ListenerConfig::default()).await;

        let browser = Request::builder()
            .header(HOST, "10.1.2.3")
            .header(USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
            .body(())
            .unwrap();
        handler.observe(&browser).await;

        let named = Request::builder()
            .header(HOST, "example.com")
            .body(())
            .unwrap();
        handler.observe(&named).await;

        assert_eq!(storage.get().await.unwrap(), None);
    }

    #[test]
    fn test_parse_host_ip() {
        assert_eq!(parse_host_ip("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_host_ip("10.0.0.1:80"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_host_ip("[::1]:443"), Some("::1".parse().unwrap()));
        assert_eq!(parse_host_ip("::1"), Some("::1".parse().unwrap()));
        assert_eq!(parse_host_ip("example.com:80"), None);
    }

    #[tokio::test]
    async fn test_close_conn_sets_http11_alpn() {
        let config = ListenerConfig {
            close_conn_on_cert_change: true,
            ..Default::default()
        };
        let (listener, _handler, _storage) = setup_listener(config).await;

        assert_eq!(listener.inner.base_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(listener.inner.conns.is_some());
    }
}

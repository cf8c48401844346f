//! Dynlistener - Main entry point
//!
//! Serves HTTPS with a self-issued certificate that expands to cover every
//! name and address clients use.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;
use tower::Layer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use dynlistener::http::{HttpsRedirectLayer, ServedOverTls};
use dynlistener::{
    CacheHandler, DynamicListener, FileStorage, FilterFn, ListenerConfig, ListenerMetrics,
    MemoryStorage, TlsStorage,
};
use dynlistener_cert::CaKeypair;
use dynlistener_config::{CaConfig, Config, LogFormat, StorageConfig};

/// Pause after a failed accept, e.g. while out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Dynlistener - HTTPS listener with on-demand certificates
#[derive(Parser, Debug)]
#[command(name = "dynlistener")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "DYNLISTENER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log as JSON regardless of configuration
    #[arg(long = "log-json")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the listener (default)
    Serve,
    /// Validate the configuration file and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => check_config(cli.config),
        Some(Commands::Serve) | None => serve(cli).await,
    }
}

fn init_logging(level: &str, format: LogFormat, verbose: bool, force_json: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if force_json || format == LogFormat::Json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let Some(path) = path else {
        bail!("no configuration file given; use --config or DYNLISTENER_CONFIG");
    };
    let config = Config::from_file(&path).context("Failed to load configuration file")?;
    let result = config.validate_all();

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    for err in &result.errors {
        error!("{}", err);
    }
    if result.has_errors() {
        bail!(
            "configuration file {} has {} error(s)",
            path.display(),
            result.errors.len()
        );
    }

    println!(
        "dynlistener: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

async fn serve(cli: Cli) -> Result<()> {
    let (config, warnings) = match &cli.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => (Config::default(), Vec::new()),
    };
    init_logging(
        &config.logging.level,
        config.logging.format,
        cli.verbose,
        cli.log_json,
    );
    for warning in &warnings {
        warn!("{}", warning);
    }
    if cli.config.is_none() {
        info!("No configuration specified, using defaults");
    }

    // kube's TLS stack needs a process-wide provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let ca = Arc::new(load_ca(&config.ca)?);
    let storage = build_storage(&config.storage).await?;

    let registry = Registry::new();
    let metrics = ListenerMetrics::new().context("Failed to create metrics")?;
    metrics
        .register(&registry)
        .context("Failed to register metrics")?;

    let listener_config = ListenerConfig {
        common_name: config.listener.common_name.clone(),
        organization: config.listener.organization.clone(),
        sans: config.listener.sans.clone(),
        max_sans: config.listener.max_sans,
        expiration_days_check: config.listener.expiration_days_check,
        close_conn_on_cert_change: config.listener.close_conn_on_cert_change,
        filter_cn: allowed_names_filter(&config.listener.allowed_names),
        metrics: Some(metrics),
        ..Default::default()
    };

    let tcp = TcpListener::bind(&config.listener.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listener.address))?;
    let (listener, cache) = DynamicListener::new(tcp, storage, ca, listener_config)
        .await
        .context("Failed to start dynamic listener")?;
    info!(address = %config.listener.address, "HTTPS listening");

    if let Some(address) = &config.listener.redirect_address {
        let redirect = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        info!(address = %address, "HTTP redirect listening");
        tokio::spawn(serve_redirect(redirect));
    }

    let state = Arc::new(AppState { cache, registry });
    tokio::select! {
        _ = accept_loop(&listener, state) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal, stopping");
        }
    }

    listener.shutdown();
    Ok(())
}

fn load_ca(config: &CaConfig) -> Result<CaKeypair> {
    match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => {
            CaKeypair::load_or_generate(cert, key, &config.common_name, &config.organization)
                .context("Failed to load CA")
        }
        _ => {
            warn!("No CA files configured, generating an ephemeral CA");
            CaKeypair::generate(&config.common_name, &config.organization)
                .context("Failed to generate CA")
        }
    }
}

async fn build_storage(config: &StorageConfig) -> Result<Arc<dyn TlsStorage>> {
    let storage: Arc<dyn TlsStorage> = match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::new()),
        StorageConfig::File { path } => {
            info!(path = %path.display(), "Persisting serving certificate to file");
            Arc::new(MemoryStorage::backed(Arc::new(FileStorage::new(path))))
        }
        StorageConfig::Kubernetes { namespace, name } => {
            kubernetes_storage(namespace, name).await?
        }
    };
    Ok(storage)
}

#[cfg(feature = "kubernetes")]
async fn kubernetes_storage(namespace: &str, name: &str) -> Result<Arc<dyn TlsStorage>> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!(namespace, name, "Persisting serving certificate to Kubernetes secret");
    let secrets = dynlistener::KubernetesStorage::new(client, namespace, name);
    Ok(Arc::new(MemoryStorage::backed(Arc::new(secrets))))
}

#[cfg(not(feature = "kubernetes"))]
async fn kubernetes_storage(_namespace: &str, _name: &str) -> Result<Arc<dyn TlsStorage>> {
    bail!("Kubernetes storage requires the `kubernetes` feature")
}

fn allowed_names_filter(allowed: &[String]) -> Option<FilterFn> {
    if allowed.is_empty() {
        return None;
    }
    let allowed = allowed.to_vec();
    Some(Arc::new(move |names: &[String]| {
        names
            .iter()
            .filter(|name| allowed.contains(name))
            .cloned()
            .collect()
    }))
}

struct AppState {
    cache: CacheHandler,
    registry: Registry,
}

/// Call `accept` until it succeeds, pausing after each failure.
async fn retry_accept<T, E, F, Fut>(what: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept {}", what);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_loop(listener: &DynamicListener<TcpListener>, state: Arc<AppState>) {
    loop {
        let accepted = retry_accept("connection", || listener.accept()).await;

        let state = state.clone();
        tokio::spawn(async move {
            let peer = accepted.peer_addr().ok();
            let tls = match accepted.handshake().await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = ?peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                let state = state.clone();
                req.extensions_mut().insert(ServedOverTls);
                async move { Ok::<_, Infallible>(handle(req, &state).await) }
            });
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(peer = ?peer, error = %e, "Connection closed with error");
            }
        });
    }
}

async fn handle(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/ping" => Response::new(Full::new(Bytes::from_static(b"pong"))),
        "/metrics" => match TextEncoder::new().encode_to_string(&state.registry.gather()) {
            Ok(body) => Response::new(Full::new(Bytes::from(body))),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        },
        _ => {
            state.cache.observe(&req).await;
            Response::new(Full::new(Bytes::new()))
        }
    }
}

async fn serve_redirect(listener: TcpListener) {
    loop {
        let (stream, peer) = retry_accept("redirect connection", || listener.accept()).await;

        tokio::spawn(async move {
            let inner = tower::service_fn(|req: Request<Incoming>| async move {
                let body = if req.uri().path() == "/ping" { "pong" } else { "" };
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                    body.as_bytes(),
                ))))
            });
            let service = TowerToHyperService::new(HttpsRedirectLayer::new().layer(inner));
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Redirect connection closed with error");
            }
        });
    }
}

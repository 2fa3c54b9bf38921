//! Claude Quota Monitor
//!
//! Single-binary service that:
//! 1. Reads the Claude CLI's OAuth credentials (keychain or credentials file)
//! 2. Probes the messages API for the unified rate-limit headers
//! 3. Refreshes and persists rotated tokens when the access token expires
//! 4. Polls on an adaptive cadence and logs a status line per change
//! 5. Optionally serves `/status`, `/health`, and `/metrics`

mod config;
mod metrics;
mod scheduler;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::{
    CredentialStore, FileBackend, KeychainBackend, SecretBackend, TokenRefresher,
};
use anthropic_quota::{QuotaProbe, QuotaService};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BackendKind, Config};
use crate::scheduler::{PollPolicy, PollSnapshot};
use crate::status::StatusState;

/// Time allowed for the status listener to finish in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<String>,
    once: bool,
}

impl Args {
    fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = Args::default();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let path = iter.next().context("--config requires a path")?;
                    parsed.config = Some(path.clone());
                }
                "--once" => parsed.once = true,
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let raw: Vec<String> = std::env::args().collect();
    let args = Args::parse(&raw)?;

    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let service = Arc::new(build_service(&config)?);

    if args.once {
        return run_once(&service).await;
    }

    info!(
        normal_interval_secs = config.poll.normal_interval_secs,
        elevated_interval_secs = config.poll.elevated_interval_secs,
        elevated_threshold = config.poll.elevated_threshold,
        backend = service.credential_store().backend_id(),
        "starting claude-quota-monitor"
    );

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let scheduler = scheduler::spawn(service.clone(), PollPolicy::from_config(&config));
    let consumer = tokio::spawn(log_status_lines(scheduler.subscribe()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = match config.status.listen_addr {
        Some(addr) => {
            let app = status::router(StatusState {
                snapshots: scheduler.subscribe(),
                trigger: scheduler.trigger(),
                prometheus: prometheus_handle,
            });
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind to {addr}"))?;
            info!(addr = %addr, "status endpoint listening");
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            }))
        }
        None => None,
    };

    shutdown_signal().await;

    scheduler.stop();
    consumer.abort();

    if let Some(server) = server {
        let _ = shutdown_tx.send(());
        match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "status server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "status server task panicked"),
            Err(_) => warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            ),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wire the credential backend, refresher, and probe from config.
fn build_service(config: &Config) -> Result<QuotaService> {
    let backend: Arc<dyn SecretBackend> = match config.credentials.backend {
        BackendKind::Keychain => {
            let backend = KeychainBackend::new(
                config.credentials.service.clone(),
                config.credentials.account(),
            );
            info!(
                service = backend.service(),
                account = backend.account(),
                "using keychain credentials"
            );
            Arc::new(backend)
        }
        BackendKind::File => {
            let backend = FileBackend::new(config.credentials.file_path()?);
            info!(path = %backend.path().display(), "using credentials file");
            Arc::new(backend)
        }
    };

    let client = reqwest::Client::new();
    let refresher = TokenRefresher::with_endpoint(client.clone(), config.api.token_url.clone())
        .with_timeout(config.api_timeout());
    let probe = QuotaProbe::with_url(client, config.api.messages_url.clone())
        .with_model(config.api.model.clone())
        .with_timeout(config.api_timeout());

    Ok(QuotaService::new(
        CredentialStore::new(backend),
        refresher,
        probe,
    ))
}

/// Fetch once, print the quota as JSON on stdout, exit non-zero on failure.
async fn run_once(service: &QuotaService) -> Result<()> {
    match service.fetch_quota().await {
        Ok(quota) => {
            println!("{}", serde_json::to_string_pretty(&quota)?);
            Ok(())
        }
        Err(e) => {
            if e.needs_reauth() {
                error!(error = %e, "re-authentication required");
            }
            Err(e).context("quota fetch failed")
        }
    }
}

/// Log one line per published snapshot.
async fn log_status_lines(mut rx: watch::Receiver<PollSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        match (&snapshot.error, &snapshot.quota) {
            (None, Some(quota)) => info!(
                status_line = %quota.status_line(),
                utilization_7d_pct = quota.percent_used_7d(),
                critical = quota.is_critical(),
                fallback = ?quota.fallback_available(),
                interval_secs = snapshot.interval_secs,
                "quota"
            ),
            (Some(error), last) => warn!(
                error = %error,
                last_status_line = ?last.as_ref().map(|q| q.status_line()),
                interval_secs = snapshot.interval_secs,
                "quota unavailable"
            ),
            (None, None) => {}
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

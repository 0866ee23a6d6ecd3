//! Volume Replicator
//!
//! Creates a VolumeReplication for every PersistentVolumeClaim whose
//! VolumeReplicationClass resolves to a non-empty name, and removes the
//! VolumeReplications it created when that stops being the case.
//!
//! The process exposes health probes and Prometheus metrics, competes for a
//! Lease and only runs the controller while it holds it.

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_replicator::{
    run_replicator, Error, KubeLeaseApi, LeaderElectionConfig, LeaderElector, ReplicationKeys,
    ReplicatorConfig, ReplicatorMetrics, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Replicator - keeps VolumeReplications in sync with PersistentVolumeClaims
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a kubeconfig file; in-cluster or default configuration otherwise
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace the controller runs in, used for the leader election lease
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Claims whose name matches this regex are never replicated
    #[arg(long, env = "EXCLUSION_REGEX", default_value = "")]
    exclusion_regex: String,

    /// Identity written into the leader election lease
    #[arg(long, env = "HOSTNAME")]
    identity: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "1")]
    workers: usize,

    /// Interval between full resyncs of every claim, in seconds; 0 disables them
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "1800")]
    resync_interval_secs: u64,

    /// Lease duration in seconds
    #[arg(long, env = "LEASE_DURATION", default_value = "15")]
    lease_duration_secs: u64,

    /// Lease renew deadline in seconds
    #[arg(long, env = "LEASE_RENEW_DEADLINE", default_value = "10")]
    lease_renew_deadline_secs: u64,

    /// Lease retry period in seconds
    #[arg(long, env = "LEASE_RETRY_PERIOD", default_value = "2")]
    lease_retry_period_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let identity = args
        .identity
        .clone()
        .unwrap_or_else(|| format!("volume-replicator-{}", std::process::id()));

    info!("Starting Volume Replicator");
    info!("  Version: {}", volume_replicator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Identity: {}", identity);
    info!("  Workers: {}", args.workers);
    if !args.exclusion_regex.is_empty() {
        info!("  Exclusion regex: {}", args.exclusion_regex);
    }

    let health_addr = parse_addr("health", &args.health_addr)?;
    let metrics_addr = parse_addr("metrics", &args.metrics_addr)?;
    let client = build_client(args.kubeconfig.as_ref()).await?;

    let metrics = ReplicatorMetrics::new(prometheus::default_registry())?;
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let config = ReplicatorConfig {
        keys: ReplicationKeys::default(),
        exclusion_regex: args.exclusion_regex.clone(),
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_interval_secs),
    };

    let mut election = LeaderElectionConfig::new(args.namespace.clone(), identity);
    election.lease_duration = Duration::from_secs(args.lease_duration_secs);
    election.renew_deadline = Duration::from_secs(args.lease_renew_deadline_secs);
    election.retry_period = Duration::from_secs(args.lease_retry_period_secs);

    let leases = Arc::new(KubeLeaseApi::new(client.clone(), &args.namespace));
    let elector = LeaderElector::new(leases, election);
    let result = elector
        .run(shutdown, move |leading| {
            run_replicator(client, config, metrics, ready, leading)
        })
        .await;

    match &result {
        Ok(()) => info!("Volume Replicator shutdown complete"),
        Err(e) => error!("Volume Replicator stopped: {}", e),
    }
    result
}

async fn build_client(kubeconfig: Option<&PathBuf>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };

    info!("Using kubeconfig {}", path.display());
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::Configuration(format!("Cannot read kubeconfig {}: {}", path.display(), e))
    })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Configuration(format!("Invalid kubeconfig: {}", e)))?;
    Ok(Client::try_from(config)?)
}

fn parse_addr(server: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid {} server address {}: {}", server, addr, e))
    })
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = Arc::clone(&ready);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready.load(Ordering::SeqCst) => {
                            text_response(StatusCode::OK, "ok")
                        }
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

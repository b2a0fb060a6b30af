//! Engine Control Plane
//!
//! Runs the control plane of one host: the REST API, the engine processes
//! of its ranks and, when this host is the configured leader, the cluster
//! system and pool services.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use engine_control_plane::cluster::{EventSink, JoinRequest, LeaderResolver};
use engine_control_plane::{
    metrics, ApiServer, ApiServerConfig, ControlConfig, EngineState, Error, HostAggregator,
    HostContext, HttpEventSink, HttpTransport, Membership, RankSet, Result, StaticLeader,
    SystemService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Engine Control Plane - rank lifecycle, local hardware and cluster fanout
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Address other hosts reach this host on
    #[arg(long, env = "HOST_ID")]
    host_id: Option<String>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Run simulated engines and hardware
    #[arg(long, env = "SIMULATE")]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> Result<ControlConfig> {
        let mut config = match &self.config {
            Some(path) => ControlConfig::load(path)?,
            None => ControlConfig::default(),
        };

        if let Some(host_id) = &self.host_id {
            config.host_id = host_id.clone();
        }
        if let Some(addr) = &self.api_addr {
            config.api_addr = addr.clone();
        }
        if let Some(addr) = &self.health_addr {
            config.health_addr = addr.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }
        if self.simulate {
            config.simulation.enabled = true;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.load_config().context("loading configuration")?;

    info!("Starting Engine Control Plane");
    info!("  Version: {}", engine_control_plane::VERSION);
    info!("  Host: {}", config.host_id);
    info!("  REST API: {}", config.api_addr);
    info!("  Engines: {}", config.engines.len());
    info!("  Simulation: {}", config.simulation.enabled);

    metrics::register();

    let host = HostContext::from_config(&config).context("building host context")?;

    // Cluster layer
    let leader = Arc::new(StaticLeader::new(config.host_id.clone(), config.access_points()));
    let transport = HttpTransport::new(config.timeouts.host_transport())
        .context("building host transport")?;
    let aggregator = HostAggregator::new(
        Arc::new(transport.clone()),
        config.timeouts.host_transport(),
    )
    .with_local(config.host_id.clone(), host.clone());

    let membership = Arc::new(Membership::new());
    let local = JoinRequest {
        host: config.host_id.clone(),
        ranks: RankSet::from(host.registry().known_ranks()),
    };
    for member in config.cluster.members.iter().cloned().chain([local]) {
        let host_name = member.host.clone();
        membership
            .join(member)
            .with_context(|| format!("joining {}", host_name))?;
    }

    let system = Arc::new(SystemService::new(membership, aggregator, leader.clone()));
    info!(
        leader = %leader.info().leader,
        is_leader = leader.is_leader(),
        "Cluster membership initialized"
    );

    let sink: Arc<dyn EventSink> = match leader.leader() {
        Some(addr) if !leader.is_leader() => Arc::new(HttpEventSink::new(transport, addr)),
        _ => system.clone(),
    };
    host.spawn_event_loop(Some(sink));

    // Start health server
    let health_addr = config.health_addr.clone();
    let health_host = host.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_host).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig::from_addr(&config.api_addr)?;
    let api_server = Arc::new(ApiServer::new(api_config, host, system));

    let server = api_server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                server.shutdown();
            }
            Err(e) => warn!("Cannot listen for shutdown signal: {}", e),
        }
    });

    api_server.run().await.context("API server")?;

    info!("Control plane shutdown complete");
    Ok(())
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
    for directive in ["hyper=warn", "tower=warn", "axum=info", "reqwest=warn"] {
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

async fn run_health_server(addr: &str, host: Arc<HostContext>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let host = host.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let host = host.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if host.ranks_in(EngineState::Errored).is_empty() => {
                            (StatusCode::OK, "ok")
                        }
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "ranks errored"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str) -> Result<()> {
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
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    }
                }
                _ => {
                    let mut response = Response::new(Body::from("not found"));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    response
                }
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

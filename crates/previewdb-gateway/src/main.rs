//! previewdb Gateway Service
//!
//! Main entry point for client connections. Supports:
//! - PostgreSQL wire protocol (psql, ORMs, BI tools)
//! - REST API (health, readiness, federation management)
//! - Prometheus metrics (/metrics)

use anyhow::Context;
use clap::Parser;
use previewdb_common::ProxyConfig;
use previewdb_gateway::federation::{FederationCatalog, SharedCatalog};
use previewdb_gateway::http_api::{build_router, AppState};
use previewdb_gateway::pg_wire::PgWireServer;
use previewdb_gateway::{metrics, telemetry, BackendRole, PgBackend, QueryRouter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "previewdb-gateway")]
#[command(about = "previewdb Gateway - preview/production PostgreSQL routing proxy")]
struct Args {
    /// Configuration file (YAML or TOML); missing file means defaults + environment
    #[arg(long, env = "PREVIEWDB_CONFIG", default_value = "config/config.yaml")]
    config: PathBuf,

    /// Log level, overrides server.log_level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// REST API port, overrides server.http_port
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = ProxyConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("invalid configuration ({})", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }

    telemetry::init(&config.server.log_level, config.server.json_logs)?;

    info!("Starting previewdb Gateway");
    info!("  PostgreSQL address: {}", config.server.listen_addr());
    info!("  HTTP address: {}", config.server.http_addr());
    info!("  Production store: {}", config.production_db.display_target());
    info!("  Fresh store: {}", config.fresh_db.display_target());

    metrics::init_metrics();

    // Both stores must be reachable before serving
    let production = Arc::new(PgBackend::connect(BackendRole::Production, &config.production_db).await?);
    let fresh = Arc::new(PgBackend::connect(BackendRole::Fresh, &config.fresh_db).await?);

    let config = Arc::new(config);
    let catalog = Arc::new(SharedCatalog::new(FederationCatalog::empty()));
    let router = Arc::new(QueryRouter::new(
        production.clone(),
        fresh.clone(),
        catalog.clone(),
        config.clone(),
    ));

    if config.federation.enabled {
        match router.refresh_federation().await {
            Ok(tables) => info!("Federation ready: {} table(s)", tables),
            Err(_) => warn!("Serving in degraded mode: reads are not federated"),
        }
    } else {
        info!("Federation disabled");
    }

    // Start PostgreSQL wire protocol server
    let pg_server = PgWireServer::new(
        config.server.listen_addr(),
        router.clone(),
        config.limits.clone(),
    );
    let pg_listener = pg_server.bind().await?;
    let pg_handle = tokio::spawn(async move {
        if let Err(e) = pg_server.serve(pg_listener).await {
            tracing::error!("PostgreSQL server error: {}", e);
        }
    });

    // Start HTTP server for health, federation management and metrics
    let app = build_router(AppState {
        router: router.clone(),
    });
    let http_addr = config.server.http_addr();
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {}", http_addr))?;
    info!("HTTP server listening on {}", http_addr);
    info!("  /ready - Both stores reachable");
    info!("  /federation - Federation catalog (POST /federation/refresh to rebuild)");
    info!("  /metrics - Prometheus metrics");

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    info!("previewdb Gateway started successfully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down previewdb Gateway");
        }
        _ = pg_handle => {}
        _ = http_handle => {}
    }

    production.close().await;
    fresh.close().await;

    Ok(())
}

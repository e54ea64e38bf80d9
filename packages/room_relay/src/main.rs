use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use room_mux::{BrokerBridge, ConnectionRegistry, LocalBroker, LocalBrokerOptions, RoomMultiplexer};
use std::{path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod broker_client;
mod broker_hub;
mod config;
mod gateway;
mod handlers;
mod history;
mod metrics;
mod presence;
#[cfg(test)]
mod test_helpers;

use crate::auth::LocalAuthority;
use crate::broker_client::RemoteBroker;
use crate::config::{
    AuthConfig, BrokerConfig, BrokerMode, FileConfig, GatewayConfig, HistoryConfig, ServerConfig,
};
use crate::gateway::Gateway;
use crate::history::{HistoryStore, MemoryHistory, NoHistory};
use crate::metrics::ServerMetrics;
use crate::presence::Presence;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Chat relay: WebSocket rooms multiplexed over a shared broker")]
struct Cli {
    /// Config file (defaults to ./relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Where room traffic is brokered
    #[arg(long, value_enum)]
    broker: Option<BrokerMode>,

    /// Hub endpoint for remote mode, e.g. ws://hub:8090/broker
    #[arg(long)]
    broker_url: Option<String>,

    /// Expose the local broker at /broker for other nodes
    #[arg(long)]
    serve_hub: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub gateway: Arc<Gateway>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub gateway_config: Arc<GatewayConfig>,
    /// Broker served to other nodes at `/broker`, when this node is a hub
    pub hub: Option<Arc<dyn BrokerBridge>>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::client_websocket_handler))
        .route("/broker", get(handlers::broker_websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "relay=debug,room_mux=debug,tower_http=debug,info"
    } else {
        "relay=info,room_mux=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    if let Some(mode) = cli.broker {
        file_config.broker.mode = mode;
    }
    if let Some(url) = cli.broker_url {
        file_config.broker.url = Some(url);
    }
    if cli.serve_hub {
        file_config.broker.serve_hub = true;
    }

    let server_config = ServerConfig::from_file(&file_config.server, cli.host, cli.port);
    let broker_config = BrokerConfig::from_file(&file_config.broker);
    let gateway_config = GatewayConfig::from_file(&file_config.gateway);
    let auth_config = AuthConfig::from_file(&file_config.auth);
    let history_config = HistoryConfig::from_file(&file_config.history);
    let drain_timeout = config::drain_timeout(&file_config.shutdown);

    let local_broker = LocalBroker::with_options(LocalBrokerOptions {
        subscription_buffer: broker_config.subscription_buffer,
        ..Default::default()
    });
    // Remote nodes keep history on the hub so every node serves the same lines.
    let (bridge, history): (Arc<dyn BrokerBridge>, Arc<dyn HistoryStore>) = match broker_config.mode {
        BrokerMode::Local => {
            let history: Arc<dyn HistoryStore> = match history_config.max_messages_per_room {
                Some(capacity) => Arc::new(MemoryHistory::new(capacity)),
                None => Arc::new(NoHistory),
            };
            (Arc::new(local_broker.clone()), history)
        }
        BrokerMode::Remote => {
            let remote = RemoteBroker::from_config(&broker_config)
                .context("broker.url is required when broker.mode = \"remote\"")?;
            info!("Brokering rooms through hub at {}", remote.url());
            let history: Arc<dyn HistoryStore> = match history_config.max_messages_per_room {
                Some(_) => Arc::new(remote.history()),
                None => Arc::new(NoHistory),
            };
            (Arc::new(remote), history)
        }
    };
    let hub: Option<Arc<dyn BrokerBridge>> = match (broker_config.serve_hub, broker_config.mode) {
        (true, BrokerMode::Local) => Some(Arc::new(local_broker.clone())),
        (true, BrokerMode::Remote) => {
            warn!("broker.serve_hub ignored: a remote-mode node has no broker of its own to share");
            None
        }
        (false, _) => None,
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let mux = RoomMultiplexer::new(bridge, registry.clone());
    let metrics = Arc::new(ServerMetrics::new());
    let gateway = Arc::new(Gateway {
        mux: mux.clone(),
        auth: Arc::new(LocalAuthority::new(&auth_config)),
        presence: Arc::new(Presence::new(registry)),
        history,
        metrics: metrics.clone(),
        auth_required: auth_config.required,
        shutdown: tokio_util::sync::CancellationToken::new(),
    });
    let forwarder = gateway.spawn_notice_forwarder();

    let app_state = AppState {
        gateway: gateway.clone(),
        metrics,
        gateway_config: Arc::new(gateway_config),
        hub: hub.clone(),
    };
    let app = build_router(app_state);

    let addr = server_config
        .socket_addr()
        .with_context(|| format!("Invalid listen address {}:{}", server_config.host, server_config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("Relay listening on http://{}", actual_addr);
    info!("  GET /ws      - Chat client WebSocket");
    if hub.is_some() {
        info!("  GET /broker  - Broker hub for other relay nodes");
    }
    info!("  GET /health  - Health check");
    info!("  GET /metrics - Server metrics");

    // Create shutdown signal handler
    let shutdown_gateway = gateway.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown_gateway.shutdown.cancel();
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Anything that ended the server other than the signal still closes sockets.
    gateway.shutdown.cancel();

    info!("Draining room subscriptions...");
    let report = mux.shutdown(drain_timeout).await;
    if report.is_clean() {
        info!(rooms = report.closed.len(), "All room subscriptions closed");
    } else {
        warn!(
            closed = report.closed.len(),
            forced = ?report.forced,
            "Some room subscriptions were force-closed"
        );
    }
    if let Err(e) = forwarder.await {
        warn!("Room notice forwarder ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}

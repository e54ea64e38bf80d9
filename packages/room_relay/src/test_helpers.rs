use room_mux::{ConnectionId, ConnectionRegistry, LocalBroker, Payload, RoomMultiplexer, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::AppState;
use crate::auth::LocalAuthority;
use crate::config::{AuthConfig, GatewayConfig};
use crate::gateway::Gateway;
use crate::history::MemoryHistory;
use crate::metrics::ServerMetrics;
use crate::presence::Presence;

/// Build a `Gateway` over an in-process broker. The broker is returned so
/// tests can inspect it or simulate outages.
pub fn test_gateway(auth_required: bool) -> (Arc<Gateway>, LocalBroker) {
    let broker = LocalBroker::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let mux = RoomMultiplexer::new(Arc::new(broker.clone()), registry.clone());
    let auth = LocalAuthority::new(&AuthConfig {
        required: auth_required,
        jwt_secret: "test-secret".into(),
        token_ttl: Duration::from_secs(3600),
        allow_registration: true,
    });

    let gateway = Arc::new(Gateway {
        mux,
        auth: Arc::new(auth),
        presence: Arc::new(Presence::new(registry)),
        history: Arc::new(MemoryHistory::new(100)),
        metrics: Arc::new(ServerMetrics::new()),
        auth_required,
        shutdown: tokio_util::sync::CancellationToken::new(),
    });
    (gateway, broker)
}

/// Build a fully-wired `AppState` acting as a hub over its local broker.
pub fn test_app_state(auth_required: bool) -> (AppState, LocalBroker) {
    let (gateway, broker) = test_gateway(auth_required);
    let state = AppState {
        metrics: gateway.metrics.clone(),
        gateway,
        gateway_config: Arc::new(GatewayConfig { outbound_queue: 64 }),
        hub: Some(Arc::new(broker.clone())),
    };
    (state, broker)
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = crate::build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Serve only `/broker` over `broker`.
pub async fn spawn_hub(broker: LocalBroker) -> SocketAddr {
    let (mut state, _) = test_app_state(false);
    state.hub = Some(Arc::new(broker));
    spawn_server(state).await
}

/// A registered connection whose outbound queue the test reads directly.
pub struct TestClient {
    pub id: ConnectionId,
    rx: mpsc::Receiver<Payload>,
}

impl TestClient {
    pub fn connect(gateway: &Gateway) -> Self {
        let id = ConnectionId::new();
        let (transport, rx) = Transport::channel(64);
        gateway.mux.registry().register(id, transport);
        Self { id, rx }
    }

    pub async fn next(&mut self) -> serde_json::Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        serde_json::from_str(&payload).expect("frame is JSON")
    }
}

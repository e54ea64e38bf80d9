use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mux = &state.gateway.mux;
    let rooms = mux.rooms().await;
    let open = rooms.iter().filter(|r| r.upstream_open).count() as u64;
    let lost = rooms.iter().filter(|r| r.upstream_lost).count() as u64;
    let metrics = state.metrics.snapshot(mux.stats());

    let status = if metrics.errors.broker == 0 && lost == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        rooms: metrics::RoomHealth { open, lost },
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot(state.gateway.mux.stats()))
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - 503 once shutdown has begun
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    if state.gateway.mux.is_shutting_down() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "reason": "shutting_down"
            })),
        )
            .into_response()
    } else {
        Json(serde_json::json!({
            "status": "ready",
            "rooms": state.gateway.mux.room_count()
        }))
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use room_mux::ConnectionId;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(health_live_handler))
            .route("/health/ready", get(health_ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_open_rooms() {
        let (state, _broker) = crate::test_helpers::test_app_state(false);
        let conn = ConnectionId::new();
        let (transport, _rx) = room_mux::Transport::channel(8);
        state.gateway.mux.registry().register(conn, transport);
        state.gateway.mux.join("lobby", conn).await.unwrap();

        let (status, json) = get_json(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["rooms"]["open"], 1);
        assert_eq!(json["rooms"]["lost"], 0);
    }

    #[tokio::test]
    async fn test_health_degraded_after_upstream_loss() {
        let (state, broker) = crate::test_helpers::test_app_state(false);
        let conn = ConnectionId::new();
        let (transport, _rx) = room_mux::Transport::channel(8);
        state.gateway.mux.registry().register(conn, transport);
        state.gateway.mux.join("lobby", conn).await.unwrap();
        broker.sever("lobby");

        let mux = state.gateway.mux.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !mux.rooms().await.iter().any(|r| r.upstream_lost) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (_, json) = get_json(router(state), "/health").await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["rooms"]["lost"], 1);
    }

    #[tokio::test]
    async fn test_metrics_and_live() {
        let (state, _broker) = crate::test_helpers::test_app_state(false);
        state.metrics.connection_opened();

        let (status, json) = get_json(router(state.clone()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["rooms"]["upstreams_opened"], 0);

        let (_, json) = get_json(router(state), "/health/live").await;
        assert_eq!(json["status"], "alive");
    }

    #[tokio::test]
    async fn test_ready_flips_on_shutdown() {
        let (state, _broker) = crate::test_helpers::test_app_state(false);
        let (status, _) = get_json(router(state.clone()), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);

        state.gateway.mux.shutdown(Duration::from_secs(1)).await;
        let (status, json) = get_json(router(state), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "not_ready");
    }
}

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::AppState;
use crate::broker_hub::handle_broker_ws;
use crate::gateway::handle_client_ws;

/// Client gateway socket
pub async fn client_websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.gateway.mux.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let gateway = state.gateway.clone();
    let outbound_queue = state.gateway_config.outbound_queue;
    ws.on_upgrade(move |socket| handle_client_ws(socket, gateway, outbound_queue))
}

/// Broker hub socket for other relay nodes. Only served by hub nodes.
pub async fn broker_websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(hub) = state.hub.clone() else {
        debug!("Rejected /broker upgrade: this node is not a hub");
        return StatusCode::NOT_FOUND.into_response();
    };
    let history = state.gateway.history.clone();
    ws.on_upgrade(move |socket| handle_broker_ws(socket, hub, history))
}

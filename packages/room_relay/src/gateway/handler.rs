//! WebSocket Handler
//!
//! One task pair per client socket: the sender drains the connection's
//! outbound queue, the input loop parses frames and hands them to the
//! gateway.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use room_mux::{ConnectionId, Transport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::Gateway;
use super::protocol::{ClientEvent, ServerEvent};

/// Handle a client WebSocket connection
pub async fn handle_client_ws(socket: WebSocket, gateway: Arc<Gateway>, outbound_queue: usize) {
    let conn = ConnectionId::new();
    info!(conn_id = %conn, "New client WebSocket connection");
    gateway.metrics.connection_opened();

    let (transport, mut rx) = Transport::channel(outbound_queue);
    let kicked = transport.kicked();
    gateway.mux.registry().register(conn, transport);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send queued frames to the WebSocket
    let metrics = gateway.metrics.clone();
    let shutdown = gateway.shutdown.clone();
    let sender_task = async move {
        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(conn_id = %conn, "Server shutting down, closing client socket");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                _ = kicked.cancelled() => {
                    warn!(conn_id = %conn, "Outbound queue overflowed, dropping connection");
                    metrics.connection_kicked();
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                payload = rx.recv() => payload,
            };
            let Some(payload) = payload else { break };
            if let Err(e) = ws_sender.send(Message::Text(payload.to_string().into())).await {
                debug!(conn_id = %conn, error = %e, "WebSocket write failed");
                metrics.websocket_error();
                break;
            }
            metrics.frame_sent();
        }
    };

    // Task to handle incoming frames. It is only ever stopped between
    // frames, never in the middle of handling one.
    let stop_input = CancellationToken::new();
    let stop = stop_input.clone();
    let gateway_input = gateway.clone();
    let input_task = async move {
        loop {
            let msg = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                msg = ws_receiver.next() => msg,
            };
            let Some(msg) = msg else { break };
            match msg {
                Ok(Message::Text(text)) => {
                    gateway_input.metrics.frame_received();
                    match ClientEvent::parse(text.as_str()) {
                        Ok(event) => gateway_input.handle(conn, event).await,
                        Err(e) => {
                            debug!(conn_id = %conn, error = %e, "Rejected client frame");
                            gateway_input.metrics.protocol_error();
                            gateway_input
                                .reply(conn, ServerEvent::error(e.error_code(), e.to_string()));
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    gateway_input.metrics.protocol_error();
                    gateway_input.reply(
                        conn,
                        ServerEvent::error("malformed_frame", "binary frames are not supported"),
                    );
                }
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %conn, "Client closed WebSocket");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(conn_id = %conn, error = %e, "WebSocket read failed");
                    gateway_input.metrics.websocket_error();
                    break;
                }
            }
        }
    };

    tokio::pin!(sender_task);
    tokio::pin!(input_task);
    let input_ended = tokio::select! {
        _ = &mut sender_task => false,
        _ = &mut input_task => true,
    };
    if input_ended {
        debug!(conn_id = %conn, "Input task ended");
    } else {
        debug!(conn_id = %conn, "Sender task ended");
        stop_input.cancel();
        input_task.await;
    }

    gateway.disconnect(conn).await;
    gateway.metrics.connection_closed();
    info!(conn_id = %conn, "Client WebSocket connection closed");
}

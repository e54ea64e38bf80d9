//! Broker hub
//!
//! Exposes this node's broker and message history to other relay nodes over
//! `GET /broker`. Each socket may hold any number of channel subscriptions;
//! closing the socket releases all of them.
//!
//! Publishes and appends are fire-and-forget: a failure is logged here and
//! nothing is sent back, so a peer that never reads its socket cannot back
//! up the hub.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use room_mux::{BrokerBridge, Payload, SubscriptionHandle, SubscriptionStream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::protocol::ChatMessage;
use crate::history::HistoryStore;

/// Frames a remote node sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HubRequest {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: String },
    Append { channel: String, message: ChatMessage },
    Range { channel: String },
}

/// Frames the hub sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HubReply {
    Subscribed { channel: String },
    Message { channel: String, payload: String },
    History { channel: String, messages: Vec<ChatMessage> },
    Error { message: String },
}

/// Frames queued toward one hub socket.
const HUB_OUTBOUND_QUEUE: usize = 256;

struct ChannelSub {
    handle: SubscriptionHandle,
    stop: CancellationToken,
}

/// Serve one hub socket until it closes.
pub async fn handle_broker_ws(
    socket: WebSocket,
    broker: Arc<dyn BrokerBridge>,
    history: Arc<dyn HistoryStore>,
) {
    info!("Broker hub peer connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<HubReply>(HUB_OUTBOUND_QUEUE);

    let sender_task = async move {
        while let Some(reply) = rx.recv().await {
            let json = match serde_json::to_string(&reply) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Failed to serialize hub reply: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let mut subs: HashMap<String, ChannelSub> = HashMap::new();
    let input_tx = tx.clone();
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "Hub socket read failed");
                    break;
                }
            };
            let request = match serde_json::from_str::<HubRequest>(text.as_str()) {
                Ok(r) => r,
                Err(e) => {
                    let _ = input_tx
                        .send(HubReply::Error {
                            message: format!("malformed hub frame: {e}"),
                        })
                        .await;
                    continue;
                }
            };
            handle_request(request, broker.as_ref(), history.as_ref(), &mut subs, &input_tx).await;
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Hub sender task ended"),
        _ = input_task => debug!("Hub input task ended"),
    }

    let released = subs.len();
    for (_, sub) in subs.drain() {
        close_sub(sub).await;
    }
    info!(released, "Broker hub peer disconnected");
}

async fn handle_request(
    request: HubRequest,
    broker: &dyn BrokerBridge,
    history: &dyn HistoryStore,
    subs: &mut HashMap<String, ChannelSub>,
    tx: &mpsc::Sender<HubReply>,
) {
    match request {
        HubRequest::Subscribe { channel } => {
            if subs.contains_key(&channel) {
                let _ = tx.send(HubReply::Subscribed { channel }).await;
                return;
            }
            match broker.open_subscription(&channel).await {
                Ok(subscription) => {
                    let stop = CancellationToken::new();
                    spawn_pump(channel.clone(), subscription.stream, stop.clone(), tx.clone());
                    subs.insert(
                        channel.clone(),
                        ChannelSub {
                            handle: subscription.handle,
                            stop,
                        },
                    );
                    debug!(channel = %channel, "Hub subscription opened");
                    let _ = tx.send(HubReply::Subscribed { channel }).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(HubReply::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }
        HubRequest::Unsubscribe { channel } => {
            if let Some(sub) = subs.remove(&channel) {
                close_sub(sub).await;
                debug!(channel = %channel, "Hub subscription closed");
            }
        }
        HubRequest::Publish { channel, payload } => {
            if let Err(e) = broker.publish(&channel, Payload::from(payload)).await {
                warn!(channel = %channel, error = %e, "Hub publish failed");
            }
        }
        HubRequest::Append { channel, message } => {
            if let Err(e) = history.append(&channel, message).await {
                warn!(channel = %channel, error = %e, "Hub history append failed");
            }
        }
        HubRequest::Range { channel } => {
            let reply = match history.range(&channel).await {
                Ok(messages) => HubReply::History { channel, messages },
                Err(e) => HubReply::Error {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(reply).await;
        }
    }
}

async fn close_sub(mut sub: ChannelSub) {
    sub.stop.cancel();
    if let Err(e) = sub.handle.close().await {
        debug!(error = %e, "Hub subscription was already closed");
    }
}

/// Forward one channel's payloads to the socket. A stream that ends without
/// an unsubscribe means the upstream died; the peer is told so.
fn spawn_pump(
    channel: String,
    mut stream: SubscriptionStream,
    stop: CancellationToken,
    tx: mpsc::Sender<HubReply>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                payload = stream.recv() => match payload {
                    Some(payload) => {
                        let reply = HubReply::Message {
                            channel: channel.clone(),
                            payload: payload.to_string(),
                        };
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!(channel = %channel, "Hub upstream ended");
                        let _ = tx
                            .send(HubReply::Error {
                                message: format!("channel {channel} closed"),
                            })
                            .await;
                        break;
                    }
                },
            }
        }
    });
}

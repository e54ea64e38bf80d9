//! Remote broker bridge
//!
//! Reaches a hub node's `/broker` endpoint. Every subscription rides its own
//! socket so closing one never disturbs another; publishes share a single
//! lazily opened socket. History requests go to the hub as well, so every
//! node reads and writes the same per-room lines.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use room_mux::{BrokerBridge, BrokerError, Payload, Subscription, SubscriptionFeed};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::broker_hub::{HubReply, HubRequest};
use crate::config::BrokerConfig;
use crate::gateway::protocol::ChatMessage;
use crate::history::{HistoryError, HistoryStore};

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RemoteBroker {
    url: String,
    connect_timeout: Duration,
    subscription_buffer: usize,
    publisher: HubLink,
}

impl RemoteBroker {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, subscription_buffer: usize) -> Self {
        let url = url.into();
        Self {
            publisher: HubLink::new(url.clone(), connect_timeout),
            url,
            connect_timeout,
            subscription_buffer,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Option<Self> {
        let url = config.url.as_deref()?;
        Some(Self::new(url, config.connect_timeout, config.subscription_buffer))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// History store backed by the same hub.
    pub fn history(&self) -> RemoteHistory {
        RemoteHistory {
            link: HubLink::new(self.url.clone(), self.connect_timeout),
        }
    }
}

async fn connect_hub(url: &str, connect_timeout: Duration) -> Result<HubSocket, BrokerError> {
    match tokio::time::timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(BrokerError::Unavailable(format!(
            "connect to {url} failed: {e}"
        ))),
        Err(_) => Err(BrokerError::Unavailable(format!(
            "connect to {url} timed out"
        ))),
    }
}

fn encode(request: &HubRequest) -> Result<Message, BrokerError> {
    serde_json::to_string(request)
        .map(|json| Message::Text(json.into()))
        .map_err(|e| BrokerError::Unavailable(format!("failed to encode hub frame: {e}")))
}

/// Read until `accept` takes a frame or the hub reports an error. Frames
/// neither of them claims are skipped.
async fn await_reply<T>(
    socket: &mut HubSocket,
    wait: Duration,
    what: &str,
    mut accept: impl FnMut(HubReply) -> Option<T>,
) -> Result<T, BrokerError> {
    let reply = async {
        while let Some(frame) = socket.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(BrokerError::Unavailable(e.to_string())),
            };
            match serde_json::from_str::<HubReply>(text.as_str()) {
                Ok(HubReply::Error { message }) => return Err(BrokerError::Unavailable(message)),
                Ok(reply) => {
                    if let Some(value) = accept(reply) {
                        return Ok(value);
                    }
                    debug!(what, "Skipping unrelated hub frame");
                }
                Err(e) => debug!(error = %e, "Unparseable hub frame"),
            }
        }
        Err(BrokerError::Unavailable(format!("hub closed before {what} completed")))
    };
    tokio::time::timeout(wait, reply)
        .await
        .map_err(|_| BrokerError::Unavailable(format!("{what} timed out")))?
}

/// One lazily opened hub socket shared by fire-and-forget sends and
/// request/reply exchanges. Requests hold the lock until their reply arrives.
struct HubLink {
    url: String,
    connect_timeout: Duration,
    socket: Mutex<Option<HubSocket>>,
}

impl HubLink {
    fn new(url: String, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
            socket: Mutex::new(None),
        }
    }

    async fn send(&self, request: &HubRequest) -> Result<(), BrokerError> {
        let frame = encode(request)?;
        let mut slot = self.socket.lock().await;
        // One retry on a fresh socket covers a hub that restarted since the
        // last send.
        for attempt in 0..2 {
            if slot.is_none() {
                *slot = Some(connect_hub(&self.url, self.connect_timeout).await?);
            }
            let Some(socket) = slot.as_mut() else {
                continue;
            };
            match socket.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(hub = %self.url, attempt, error = %e, "Send to hub failed");
                    *slot = None;
                }
            }
        }
        Err(BrokerError::Unavailable(format!(
            "send to {} failed after reconnect",
            self.url
        )))
    }

    async fn range(&self, channel: &str) -> Result<Vec<ChatMessage>, BrokerError> {
        let frame = encode(&HubRequest::Range {
            channel: channel.to_string(),
        })?;
        let mut slot = self.socket.lock().await;
        let result = async {
            if slot.is_none() {
                *slot = Some(connect_hub(&self.url, self.connect_timeout).await?);
            }
            let Some(socket) = slot.as_mut() else {
                return Err(BrokerError::Unavailable("hub socket missing".into()));
            };
            socket
                .send(frame)
                .await
                .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
            await_reply(socket, self.connect_timeout, "history range", |reply| match reply {
                HubReply::History { channel: c, messages } if c == channel => Some(messages),
                _ => None,
            })
            .await
        }
        .await;
        // A half-read exchange leaves the socket out of step.
        if result.is_err() {
            *slot = None;
        }
        result
    }
}

#[async_trait]
impl BrokerBridge for RemoteBroker {
    async fn publish(&self, room: &str, payload: Payload) -> Result<(), BrokerError> {
        self.publisher
            .send(&HubRequest::Publish {
                channel: room.to_string(),
                payload: payload.to_string(),
            })
            .await
            .map_err(|e| {
                warn!(room = %room, error = %e, "Publish to hub failed");
                e
            })
    }

    async fn open_subscription(&self, room: &str) -> Result<Subscription, BrokerError> {
        let mut socket = connect_hub(&self.url, self.connect_timeout).await?;
        socket
            .send(encode(&HubRequest::Subscribe {
                channel: room.to_string(),
            })?)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        await_reply(
            &mut socket,
            self.connect_timeout,
            &format!("subscribe to {room}"),
            |reply| match reply {
                HubReply::Subscribed { channel } if channel == room => Some(()),
                _ => None,
            },
        )
        .await?;

        let (subscription, feed) = Subscription::channel(room, self.subscription_buffer);
        tokio::spawn(pump(room.to_string(), socket, feed));
        info!(room = %room, hub = %self.url, "Remote subscription opened");
        Ok(subscription)
    }
}

/// History kept by the hub node, shared by every node attached to it.
pub struct RemoteHistory {
    link: HubLink,
}

#[async_trait]
impl HistoryStore for RemoteHistory {
    async fn append(&self, room: &str, message: ChatMessage) -> Result<(), HistoryError> {
        self.link
            .send(&HubRequest::Append {
                channel: room.to_string(),
                message,
            })
            .await
            .map_err(|e| HistoryError::Unavailable(e.to_string()))
    }

    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        self.link
            .range(room)
            .await
            .map_err(|e| HistoryError::Unavailable(e.to_string()))
    }
}

/// Move hub payloads into the feed until either side goes away.
async fn pump(room: String, mut socket: HubSocket, feed: SubscriptionFeed) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = feed.cancelled() => break,
            frame = socket.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                warn!(room = %room, "Hub closed the subscription socket");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(room = %room, error = %e, "Hub subscription socket failed");
                break;
            }
        };
        match serde_json::from_str::<HubReply>(text.as_str()) {
            Ok(HubReply::Message { payload, .. }) => {
                if !feed.push(Payload::from(payload)).await {
                    break;
                }
            }
            Ok(HubReply::Error { message }) => {
                warn!(room = %room, error = %message, "Hub dropped the subscription");
                break;
            }
            Ok(_) => {}
            Err(e) => debug!(room = %room, error = %e, "Unparseable hub frame"),
        }
    }

    if feed.is_cancelled() {
        if let Ok(frame) = encode(&HubRequest::Unsubscribe {
            channel: room.clone(),
        }) {
            let _ = socket.send(frame).await;
        }
        let _ = socket.close(None).await;
    }
    debug!(room = %room, "Remote subscription released");
    feed.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::spawn_hub;
    use room_mux::LocalBroker;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn publish_and_subscribe_through_hub() {
        let hub_broker = LocalBroker::new();
        let addr = spawn_hub(hub_broker.clone()).await;
        let remote = RemoteBroker::new(format!("ws://{addr}/broker"), WAIT, 16);

        let mut sub = remote.open_subscription("lobby").await.unwrap();
        assert_eq!(hub_broker.active_subscriptions("lobby"), 1);

        remote.publish("lobby", Payload::from("hi")).await.unwrap();
        let got = tokio::time::timeout(WAIT, sub.stream.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("hi"));

        // Traffic published on the hub itself reaches the remote side too.
        hub_broker.publish("lobby", Payload::from("local")).await.unwrap();
        let got = tokio::time::timeout(WAIT, sub.stream.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("local"));

        sub.handle.close().await.unwrap();
        tokio::time::timeout(WAIT, async {
            while hub_broker.active_subscriptions("lobby") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("hub never released the subscription");
    }

    #[tokio::test]
    async fn hub_refusal_surfaces_as_unavailable() {
        let hub_broker = LocalBroker::new();
        hub_broker.set_available(false);
        let addr = spawn_hub(hub_broker.clone()).await;
        let remote = RemoteBroker::new(format!("ws://{addr}/broker"), WAIT, 16);

        let err = remote.open_subscription("lobby").await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_hub_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = RemoteBroker::new(format!("ws://{addr}/broker"), Duration::from_secs(1), 16);
        assert!(matches!(
            remote.open_subscription("r").await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(matches!(
            remote.publish("r", Payload::from("x")).await,
            Err(BrokerError::Unavailable(_))
        ));
    }

    fn line(text: &str) -> ChatMessage {
        ChatMessage {
            room: "lobby".into(),
            login: "alice".into(),
            message: text.into(),
            date: "2024-01-01T00:00:00Z".into(),
        }
    }

    fn texts(lines: &[ChatMessage]) -> Vec<&str> {
        lines.iter().map(|l| l.message.as_str()).collect()
    }

    #[tokio::test]
    async fn history_is_shared_through_the_hub() {
        let addr = spawn_hub(LocalBroker::new()).await;
        let url = format!("ws://{addr}/broker");
        let writer = RemoteBroker::new(url.clone(), WAIT, 16).history();
        let reader = RemoteBroker::new(url, WAIT, 16).history();

        writer.append("lobby", line("one")).await.unwrap();
        writer.append("lobby", line("two")).await.unwrap();
        // The hub handles one socket's frames in order, so this range sees
        // both appends.
        assert_eq!(texts(&writer.range("lobby").await.unwrap()), vec!["one", "two"]);

        assert_eq!(texts(&reader.range("lobby").await.unwrap()), vec!["one", "two"]);
        assert!(reader.range("elsewhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_hub_history_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let history = RemoteBroker::new(format!("ws://{addr}/broker"), Duration::from_secs(1), 16).history();
        assert!(matches!(
            history.range("lobby").await,
            Err(HistoryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn failed_publish_sends_nothing_back() {
        let hub_broker = LocalBroker::new();
        hub_broker.set_available(false);
        let addr = spawn_hub(hub_broker).await;
        let mut socket = connect_hub(&format!("ws://{addr}/broker"), WAIT).await.unwrap();

        let publish = HubRequest::Publish {
            channel: "r".into(),
            payload: "x".into(),
        };
        for _ in 0..3 {
            socket.send(encode(&publish).unwrap()).await.unwrap();
        }
        socket
            .send(encode(&HubRequest::Range { channel: "r".into() }).unwrap())
            .await
            .unwrap();

        // The first frame back answers the range; the refused publishes left
        // nothing queued ahead of it.
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: HubReply = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(
            reply,
            HubReply::History {
                channel: "r".into(),
                messages: vec![]
            }
        );
    }

    #[tokio::test]
    async fn severed_hub_channel_ends_remote_stream() {
        let hub_broker = LocalBroker::new();
        let addr = spawn_hub(hub_broker.clone()).await;
        let remote = RemoteBroker::new(format!("ws://{addr}/broker"), WAIT, 16);

        let mut sub = remote.open_subscription("r").await.unwrap();
        assert!(hub_broker.sever("r"));
        let got = tokio::time::timeout(WAIT, sub.stream.recv()).await.unwrap();
        assert_eq!(got, None);
    }
}

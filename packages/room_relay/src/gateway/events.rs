//! Client event handling
//!
//! One `Gateway` serves every socket. Replies go out through the same
//! outbound queue as room traffic, so a connection sees `joined` before the
//! first message of that room.

use room_mux::{ConnectionId, MuxError, Payload, RoomMultiplexer, RoomNotice};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ChatMessage, ClientEvent, RegisterStatus, ServerEvent};
use crate::auth::{AuthError, Authenticator};
use crate::history::{HistoryError, HistoryStore};
use crate::metrics::ServerMetrics;
use crate::presence::Presence;

/// Login used for unauthenticated senders when auth is optional.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthorized,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl GatewayError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Auth(e) => e.error_code(),
            Self::Mux(e) => e.error_code(),
            Self::History(_) => "history_unavailable",
        }
    }

    fn to_frame(&self) -> ServerEvent {
        ServerEvent::error(self.error_code(), self.to_string())
    }
}

pub struct Gateway {
    pub mux: RoomMultiplexer,
    pub auth: Arc<dyn Authenticator>,
    pub presence: Arc<Presence>,
    pub history: Arc<dyn HistoryStore>,
    pub metrics: Arc<ServerMetrics>,
    pub auth_required: bool,
    /// Cancelled when the server stops; every client socket closes on it.
    pub shutdown: CancellationToken,
}

impl Gateway {
    /// Queue one frame for `conn`. An overflow kicks the connection; either
    /// way the caller moves on.
    pub fn reply(&self, conn: ConnectionId, event: ServerEvent) {
        if let Err(e) = self
            .mux
            .registry()
            .deliver(conn, Payload::from(event.to_json()))
        {
            debug!(conn_id = %conn, error = %e, "Reply not queued");
        }
    }

    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let name = event.name();
        if let Err(err) = self.dispatch(conn, event).await {
            match &err {
                GatewayError::Unauthorized | GatewayError::Auth(_) => self.metrics.auth_failure(),
                GatewayError::Mux(MuxError::BrokerUnavailable { .. }) => {
                    self.metrics.broker_error()
                }
                _ => {}
            }
            debug!(conn_id = %conn, event = name, error = %err, "Event failed");
            self.reply(conn, err.to_frame());
        }
    }

    async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), GatewayError> {
        match event {
            ClientEvent::Join { room, token } => {
                self.identify(conn, token.as_deref()).await?;
                let outcome = self.mux.join(&room, conn).await?;
                debug!(conn_id = %conn, room = %room, ?outcome, "Join handled");
                self.reply(conn, ServerEvent::Joined { room });
            }
            ClientEvent::Leave { room } => {
                self.mux.leave(&room, conn).await?;
                self.reply(conn, ServerEvent::Left { room });
            }
            ClientEvent::Message {
                room,
                message,
                date,
                token,
            } => {
                let login = self
                    .identify(conn, token.as_deref())
                    .await?
                    .unwrap_or_else(|| ANONYMOUS.to_string());
                let line = ChatMessage {
                    room,
                    login,
                    message,
                    date: date.unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                };
                let payload = Payload::from(ServerEvent::Message(line.clone()).to_json());
                self.mux.publish(&line.room, payload).await?;
                self.metrics.message_published();

                let room = line.room.clone();
                if let Err(e) = self.history.append(&room, line).await {
                    warn!(room = %room, error = %e, "Failed to record message history");
                }
            }
            ClientEvent::Login { login, password } => {
                let token = self.auth.login(&login, &password).await?;
                self.sign_in(conn, &login);
                self.reply(
                    conn,
                    ServerEvent::Authenticated {
                        token,
                        user: login,
                    },
                );
            }
            ClientEvent::Register { login, password } => {
                let frame = match self.auth.register(&login, &password).await {
                    Ok(()) => ServerEvent::Register {
                        status: RegisterStatus::Ok,
                        message: "Registration ok".to_string(),
                    },
                    Err(e) => {
                        self.metrics.auth_failure();
                        ServerEvent::Register {
                            status: RegisterStatus::Error,
                            message: e.to_string(),
                        }
                    }
                };
                self.reply(conn, frame);
            }
            ClientEvent::Auth { token } => {
                let subject = self.auth.verify(&token).await?;
                self.sign_in(conn, &subject.login);
                self.reply(
                    conn,
                    ServerEvent::Authenticated {
                        token,
                        user: subject.login,
                    },
                );
            }
            ClientEvent::GetOnlineUsers => {
                self.reply(
                    conn,
                    ServerEvent::OnlineUsers {
                        online_users: self.presence.online(),
                    },
                );
            }
            ClientEvent::GetMessages { room } => {
                let messages = self.history.range(&room).await?;
                self.reply(conn, ServerEvent::Messages { room, messages });
            }
        }
        Ok(())
    }

    /// Resolve who is acting. A token on the frame wins and signs the
    /// connection in; otherwise the connection's earlier identity is used.
    async fn identify(
        &self,
        conn: ConnectionId,
        token: Option<&str>,
    ) -> Result<Option<String>, GatewayError> {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            let subject = self.auth.verify(token).await?;
            self.sign_in(conn, &subject.login);
            return Ok(Some(subject.login));
        }
        match self.mux.registry().identity(conn) {
            Some(login) => Ok(Some(login)),
            None if self.auth_required => Err(GatewayError::Unauthorized),
            None => Ok(None),
        }
    }

    fn sign_in(&self, conn: ConnectionId, login: &str) {
        if self.mux.registry().set_identity(conn, login) {
            self.presence.connected(login, conn);
        }
    }

    /// Release everything a closed socket held.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let left = self.mux.disconnect(conn).await;
        self.presence.disconnected(conn);
        debug!(conn_id = %conn, rooms_left = left, "Gateway connection cleaned up");
    }

    /// Tell a room's members when its upstream dies. They recover by leaving
    /// and joining again.
    pub fn spawn_notice_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = self.clone();
        let cancel = self.shutdown.clone();
        let mut notices = self.mux.subscribe_notices();
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = cancel.cancelled() => break,
                    notice = notices.recv() => notice,
                };
                match notice {
                    Ok(RoomNotice::UpstreamLost { room }) => {
                        gateway.metrics.broker_error();
                        let members = gateway.mux.subscribers(&room).await;
                        info!(room = %room, members = members.len(), "Notifying members of lost upstream");
                        for conn in members {
                            gateway.reply(
                                conn,
                                ServerEvent::error(
                                    "upstream_lost",
                                    format!("room {room} lost its broker subscription; rejoin to recover"),
                                ),
                            );
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Room notice forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Room notice forwarder stopped");
        })
    }
}

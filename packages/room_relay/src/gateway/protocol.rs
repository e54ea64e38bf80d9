//! Client wire protocol
//!
//! Clients send `{"event": <name>, "data": {...}}`. Server frames are flat
//! objects tagged by `event`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl ProtocolError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_frame",
            Self::UnknownEvent(_) => "unknown_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join {
        room: String,
        token: Option<String>,
    },
    Leave {
        room: String,
    },
    Message {
        room: String,
        message: String,
        date: Option<String>,
        token: Option<String>,
    },
    Login {
        login: String,
        password: String,
    },
    Register {
        login: String,
        password: String,
    },
    Auth {
        token: String,
    },
    GetOnlineUsers,
    GetMessages {
        room: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct RoomData {
    room: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct MessageData {
    room: String,
    message: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct CredentialsData {
    login: String,
    password: String,
}

#[derive(Deserialize)]
struct TokenData {
    token: String,
}

fn data<T: serde::de::DeserializeOwned>(event: &str, value: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{event}: {e}")))
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Envelope { event, data: body } = envelope;

        let parsed = match event.as_str() {
            "join" => {
                let d: RoomData = data(&event, body)?;
                Self::Join {
                    room: d.room,
                    token: d.token,
                }
            }
            "leave" => {
                let d: RoomData = data(&event, body)?;
                Self::Leave { room: d.room }
            }
            "message" => {
                let d: MessageData = data(&event, body)?;
                Self::Message {
                    room: d.room,
                    message: d.message,
                    date: d.date,
                    token: d.token,
                }
            }
            "login" => {
                let d: CredentialsData = data(&event, body)?;
                Self::Login {
                    login: d.login,
                    password: d.password,
                }
            }
            "register" => {
                let d: CredentialsData = data(&event, body)?;
                Self::Register {
                    login: d.login,
                    password: d.password,
                }
            }
            "auth" => {
                let d: TokenData = data(&event, body)?;
                Self::Auth { token: d.token }
            }
            "getOnlineUsers" => Self::GetOnlineUsers,
            "getMessages" => {
                let d: RoomData = data(&event, body)?;
                Self::GetMessages { room: d.room }
            }
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };

        if let Some(room) = parsed.room() {
            if room.trim().is_empty() {
                return Err(ProtocolError::Malformed(format!("{event}: empty room")));
            }
        }
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Message { .. } => "message",
            Self::Login { .. } => "login",
            Self::Register { .. } => "register",
            Self::Auth { .. } => "auth",
            Self::GetOnlineUsers => "getOnlineUsers",
            Self::GetMessages { .. } => "getMessages",
        }
    }

    fn room(&self) -> Option<&str> {
        match self {
            Self::Join { room, .. }
            | Self::Leave { room }
            | Self::Message { room, .. }
            | Self::GetMessages { room } => Some(room),
            _ => None,
        }
    }
}

/// A chat line as fanned out to room members and kept in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room: String,
    pub login: String,
    pub message: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "message")]
    Message(ChatMessage),
    #[serde(rename = "joined")]
    Joined { room: String },
    #[serde(rename = "left")]
    Left { room: String },
    #[serde(rename = "authenticated")]
    Authenticated { token: String, user: String },
    #[serde(rename = "register")]
    Register { status: RegisterStatus, message: String },
    #[serde(rename = "onlineUsers")]
    OnlineUsers {
        #[serde(rename = "onlineUsers")]
        online_users: Vec<String>,
    },
    #[serde(rename = "user.statusChanged")]
    StatusChanged {
        #[serde(rename = "onlineUsers")]
        online_users: Vec<String>,
    },
    #[serde(rename = "messages")]
    Messages {
        room: String,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "error")]
    Error { message: String, code: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterStatus {
    Ok,
    Error,
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and vectors; serialization can't fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","message":"internal serialization failure","code":"internal"}"#
                .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_with_and_without_token() {
        let ev = ClientEvent::parse(r#"{"event":"join","data":{"room":"lobby"}}"#).unwrap();
        assert_eq!(
            ev,
            ClientEvent::Join {
                room: "lobby".into(),
                token: None
            }
        );

        let ev =
            ClientEvent::parse(r#"{"event":"join","data":{"room":"lobby","token":"abc"}}"#).unwrap();
        assert_eq!(
            ev,
            ClientEvent::Join {
                room: "lobby".into(),
                token: Some("abc".into())
            }
        );
    }

    #[test]
    fn parses_message_and_credentials() {
        let ev = ClientEvent::parse(
            r#"{"event":"message","data":{"room":"r","message":"hi","date":"2024-01-01"}}"#,
        )
        .unwrap();
        assert!(matches!(ev, ClientEvent::Message { ref message, .. } if message == "hi"));

        let ev =
            ClientEvent::parse(r#"{"event":"register","data":{"login":"a","password":"b"}}"#).unwrap();
        assert_eq!(ev.name(), "register");
    }

    #[test]
    fn get_online_users_needs_no_data() {
        assert_eq!(
            ClientEvent::parse(r#"{"event":"getOnlineUsers"}"#).unwrap(),
            ClientEvent::GetOnlineUsers
        );
        assert_eq!(
            ClientEvent::parse(r#"{"event":"getOnlineUsers","data":{}}"#).unwrap(),
            ClientEvent::GetOnlineUsers
        );
    }

    #[test]
    fn rejects_garbage_unknown_and_incomplete_frames() {
        let err = ClientEvent::parse("not json").unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");

        let err = ClientEvent::parse(r#"{"event":"dance","data":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("dance".into()));
        assert_eq!(err.error_code(), "unknown_event");

        let err = ClientEvent::parse(r#"{"event":"join","data":{}}"#).unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");

        let err = ClientEvent::parse(r#"{"event":"leave","data":{"room":"  "}}"#).unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");
    }

    #[test]
    fn server_frames_are_flat_and_tagged() {
        let frame = ServerEvent::Message(ChatMessage {
            room: "lobby".into(),
            login: "alice".into(),
            message: "hi".into(),
            date: "2024-01-01T00:00:00Z".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "message",
                "room": "lobby",
                "login": "alice",
                "message": "hi",
                "date": "2024-01-01T00:00:00Z"
            })
        );

        let frame = ServerEvent::StatusChanged {
            online_users: vec!["a".into(), "b".into()],
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value, json!({"event": "user.statusChanged", "onlineUsers": ["a", "b"]}));

        let value: serde_json::Value = serde_json::from_str(
            &ServerEvent::Register {
                status: RegisterStatus::Ok,
                message: "Registration ok".into(),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn error_frame_carries_code() {
        let value: serde_json::Value =
            serde_json::from_str(&ServerEvent::error("unknown_event", "nope").to_json()).unwrap();
        assert_eq!(value, json!({"event": "error", "message": "nope", "code": "unknown_event"}));
    }
}

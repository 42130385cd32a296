// ── Realtime wire vocabulary ──
//
// Frames are JSON text: `{ "event": "<name>", "data": { ... } }`.
// Server events deserialize into `ServerEvent`; client intents serialize
// from `ClientIntent`. Payload fields are camelCase on the wire.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

type Extra = serde_json::Map<String, serde_json::Value>;

// ── EventKind ────────────────────────────────────────────────────────

/// The fixed set of server-pushed event kinds listeners can subscribe to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    UserTyping,
    #[strum(serialize = "user_stop_typing")]
    UserStoppedTyping,
    RoomUpdated,
    RoomDeleted,
    UserOnline,
    UserOffline,
    Error,
    #[strum(serialize = "joined_room")]
    RoomJoined,
}

// ── Payloads ─────────────────────────────────────────────────────────

/// A chat message delivered to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "_id")]
    pub id: String,
    pub room_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Everything else the server sends, so nothing is silently dropped.
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomNotice {
    #[serde(alias = "id", alias = "_id")]
    pub room_id: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    #[serde(default)]
    pub message: String,
}

// ── ServerEvent ──────────────────────────────────────────────────────

/// A typed server-pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(ChatMessage),
    UserTyping(TypingNotice),
    #[serde(rename = "user_stop_typing")]
    UserStoppedTyping(TypingNotice),
    RoomUpdated(RoomNotice),
    RoomDeleted(RoomNotice),
    UserOnline(PresenceNotice),
    UserOffline(PresenceNotice),
    Error(ErrorNotice),
    #[serde(rename = "joined_room")]
    RoomJoined(RoomNotice),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::UserTyping(_) => EventKind::UserTyping,
            Self::UserStoppedTyping(_) => EventKind::UserStoppedTyping,
            Self::RoomUpdated(_) => EventKind::RoomUpdated,
            Self::RoomDeleted(_) => EventKind::RoomDeleted,
            Self::UserOnline(_) => EventKind::UserOnline,
            Self::UserOffline(_) => EventKind::UserOffline,
            Self::Error(_) => EventKind::Error,
            Self::RoomJoined(_) => EventKind::RoomJoined,
        }
    }

    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── ClientIntent ─────────────────────────────────────────────────────

/// Fire-and-forget intents the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientIntent {
    /// Ask the server to (re)join every room this session belongs to.
    JoinAllRooms,
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    TypingStart {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    TypingStop {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl ClientIntent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

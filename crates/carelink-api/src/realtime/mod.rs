//! Realtime connection manager.
//!
//! Keeps one logical, authenticated connection to the realtime endpoint
//! alive across network loss, and fans server-pushed events out to typed
//! listeners that survive the reconnect cycle.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                          │                           │
//!      │                   handshake failed              link lost
//!      │                          ▼                           ▼
//!      └──── bound exceeded ── Reconnecting { attempt } ◀─────┘
//! ```
//!
//! Every successful handshake emits a `join_all_rooms` intent, so room
//! membership is replayed by the server rather than diffed locally.
//!
//! # Example
//!
//! ```rust,ignore
//! use carelink_api::{ConnectionManager, EventKind, RealtimeConfig, ServerEvent};
//!
//! let manager = ConnectionManager::with_websocket(RealtimeConfig::new(endpoint), credentials);
//! manager.on(EventKind::NewMessage, |event: &ServerEvent| {
//!     if let ServerEvent::NewMessage(msg) = event {
//!         println!("{}: {}", msg.room_id, msg.content);
//!     }
//! });
//! manager.connect();
//! ```

mod bus;
mod events;
mod manager;
mod transport;

use std::time::Duration;

use url::Url;

pub use bus::SubscriptionId;
pub use events::{
    ChatMessage, ClientIntent, ErrorNotice, EventKind, PresenceNotice, RoomNotice, ServerEvent,
    TypingNotice,
};
pub use manager::{ConnectionManager, ConnectionState};
pub use transport::{AuthPayload, LinkEvent, RealtimeLink, RealtimeTransport, WsTransport};

// ── Configuration ────────────────────────────────────────────────────

/// Fixed-backoff reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up. Default: 5.
    pub max_attempts: u32,
    /// Pause between attempts. Default: 1s.
    pub delay: Duration,
    /// Bound on a single handshake. Default: 5s.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub endpoint: Url,
    pub reconnect: ReconnectConfig,
}

impl RealtimeConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            reconnect: ReconnectConfig::default(),
        }
    }
}

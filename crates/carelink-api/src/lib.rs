// carelink-api: resilient request coordination and realtime connection management
//
// Two halves share one credential seam:
//   coordinator -- dedup, cancellation, token injection, error classification
//   realtime    -- reconnecting WebSocket link with typed event fan-out

pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod realtime;
pub mod transport;

pub use coordinator::{
    CoordinatorConfig, ExemptionRules, Fingerprint, GENERIC_FAILURE_MESSAGE, RequestCoordinator,
    RequestSpec, Response, SessionEvent, classify, is_rate_limit_message,
};
pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use error::Error;
pub use realtime::{
    AuthPayload, ChatMessage, ClientIntent, ConnectionManager, ConnectionState, ErrorNotice,
    EventKind, LinkEvent, PresenceNotice, RealtimeConfig, RealtimeLink, RealtimeTransport,
    ReconnectConfig, RoomNotice, ServerEvent, SubscriptionId, TypingNotice, WsTransport,
};
pub use transport::{
    FormContent, FormPart, HttpTransport, ReqwestTransport, RequestBody, TlsMode, TransportConfig,
    TransportError, TransportRequest, TransportResponse,
};

pub use reqwest::{Method, StatusCode};

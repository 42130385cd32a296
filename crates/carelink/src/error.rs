//! CLI error types with miette diagnostics.
//!
//! Maps classified `carelink_api::Error` values onto user-facing errors
//! with actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use carelink_api::Error as ApiError;
use carelink_config::ConfigError;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const RATE_LIMITED: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Session ──────────────────────────────────────────────────────
    #[error("Session expired -- please sign in again")]
    #[diagnostic(
        code(carelink::session_expired),
        help(
            "The stored token was rejected and has been cleared.\n\
             Store a fresh one with: carelink config set-token"
        )
    )]
    SessionExpired,

    #[error("No session token available")]
    #[diagnostic(
        code(carelink::no_session),
        help(
            "Set session.token_env in the config file, or store a token with:\n\
             carelink config set-token"
        )
    )]
    NoSession,

    // ── Classified request failures ──────────────────────────────────
    #[error("Too many requests -- please wait a moment and try again")]
    #[diagnostic(code(carelink::rate_limited), help("{hint}"))]
    RateLimited { hint: String },

    #[error("No response from server: {reason}")]
    #[diagnostic(
        code(carelink::network_unavailable),
        help("Check api.base_url and your network connection.")
    )]
    NetworkUnavailable { reason: String },

    #[error("{message}")]
    #[diagnostic(code(carelink::server_error), help("HTTP status {status}"))]
    Server { status: u16, message: String },

    /// Superseded or interrupted. Not reported.
    #[error("Request was cancelled")]
    Cancelled,

    // ── Realtime ─────────────────────────────────────────────────────
    #[error("Realtime endpoint unavailable")]
    #[diagnostic(
        code(carelink::realtime_unavailable),
        help("Reconnection attempts were exhausted. Check realtime.endpoint and try again.")
    )]
    RealtimeUnavailable,

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(carelink::validation))]
    Validation { field: String, reason: String },

    #[error("Config file already exists at {path}")]
    #[diagnostic(code(carelink::config_exists), help("Use --force to overwrite it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(
        code(carelink::config),
        help("Run `carelink config path` to see which file is read.")
    )]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(carelink::api))]
    Api(ApiError),

    // ── IO / serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(carelink::json))]
    Json(#[from] serde_json::Error),

    #[error("failed to render config: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => exit_code::SUCCESS,
            Self::SessionExpired | Self::NoSession => exit_code::AUTH,
            Self::RateLimited { .. } => exit_code::RATE_LIMITED,
            Self::NetworkUnavailable { .. } | Self::RealtimeUnavailable => exit_code::CONNECTION,
            Self::Server { status: 403, .. } => exit_code::PERMISSION,
            Self::Server { status: 404, .. } => exit_code::NOT_FOUND,
            Self::Server { status: 409, .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::ConfigExists { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    /// Errors that end the process without a diagnostic.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ApiError> for CliError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::SessionExpired => Self::SessionExpired,
            ApiError::RateLimited { retry_after } => Self::RateLimited {
                hint: retry_after.map_or_else(
                    || "The server did not say how long to wait.".to_owned(),
                    |d| format!("Retry after {}s.", d.as_secs()),
                ),
            },
            ApiError::NetworkUnavailable { reason } => Self::NetworkUnavailable { reason },
            ApiError::Server { status, message } => Self::Server { status, message },
            ApiError::Cancelled => Self::Cancelled,
            other => Self::Api(other),
        }
    }
}

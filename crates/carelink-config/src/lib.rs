//! Shared configuration for Carelink tools.
//!
//! TOML file + `CARELINK_` environment overrides, translated into the
//! runtime configs of `carelink_api`, plus credential resolution
//! (env var, then system keyring).

mod keyring_store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use carelink_api::{
    CoordinatorConfig, CredentialStore, ExemptionRules, MemoryCredentialStore, RealtimeConfig,
    ReconnectConfig, TlsMode, TransportConfig,
};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub use keyring_store::KeyringCredentialStore;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("missing required setting '{field}'")]
    Missing { field: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiSection,
    pub realtime: RealtimeSection,
    pub session: SessionSection,
}

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSection {
    /// API root, e.g. "https://api.carelink.example/v1".
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub dedup_window_ms: u64,
    pub stale_after_ms: u64,
    /// Path substrings that are never deduplicated.
    pub exempt_paths: Vec<String>,
    /// Skip TLS verification (local development only).
    pub insecure: bool,
    /// Path to a custom CA certificate (PEM).
    pub ca_cert: Option<PathBuf>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 60,
            dedup_window_ms: 300,
            stale_after_ms: 5_000,
            exempt_paths: ExemptionRules::default().path_patterns,
            insecure: false,
            ca_cert: None,
        }
    }
}

/// Realtime endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// WebSocket URL, e.g. "wss://api.carelink.example/realtime".
    pub endpoint: Option<String>,
    pub connect_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: 5,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
        }
    }
}

/// Where the session token comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSection {
    /// Keyring namespace: the token lives at `carelink/<profile>/token`.
    pub profile: String,
    /// Name of an environment variable holding the token. Checked before the keyring.
    pub token_env: Option<String>,
    pub user_id: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            profile: "default".into(),
            token_env: None,
            user_id: None,
        }
    }
}

// ── Translation into runtime configs ────────────────────────────────

impl Config {
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        parse_url("api.base_url", self.api.base_url.as_deref(), &["http", "https"])
    }

    pub fn transport_config(&self) -> TransportConfig {
        let tls = if self.api.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca_path) = self.api.ca_cert {
            TlsMode::CustomCa(ca_path.clone())
        } else {
            TlsMode::System
        };
        TransportConfig {
            tls,
            timeout: Duration::from_secs(self.api.timeout_secs),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            dedup_window: Duration::from_millis(self.api.dedup_window_ms),
            stale_after: Duration::from_millis(self.api.stale_after_ms),
            timeout: Duration::from_secs(self.api.timeout_secs),
            exemptions: ExemptionRules {
                path_patterns: self.api.exempt_paths.clone(),
            },
        }
    }

    pub fn realtime_config(&self) -> Result<RealtimeConfig, ConfigError> {
        let endpoint = parse_url(
            "realtime.endpoint",
            self.realtime.endpoint.as_deref(),
            &["ws", "wss"],
        )?;
        Ok(RealtimeConfig {
            endpoint,
            reconnect: ReconnectConfig {
                max_attempts: self.realtime.reconnect_attempts,
                delay: Duration::from_millis(self.realtime.reconnect_delay_ms),
                connect_timeout: Duration::from_secs(self.realtime.connect_timeout_secs),
            },
        })
    }

    /// Build the credential store for this session.
    ///
    /// A token in `session.token_env` wins and is held in memory only;
    /// otherwise the system keyring is consulted lazily.
    pub fn credential_store(&self) -> Arc<dyn CredentialStore> {
        if let Some(ref env_name) = self.session.token_env {
            if let Ok(token) = std::env::var(env_name) {
                debug!(env = %env_name, "using session token from environment");
                return Arc::new(MemoryCredentialStore::with_session(
                    token,
                    self.session.user_id.clone(),
                ));
            }
        }
        match KeyringCredentialStore::new(&self.session.profile, self.session.user_id.clone()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "system keyring unavailable, continuing signed out");
                Arc::new(MemoryCredentialStore::new())
            }
        }
    }
}

fn parse_url(field: &str, raw: Option<&str>, schemes: &[&str]) -> Result<Url, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::Missing {
        field: field.into(),
    })?;
    let url = Url::parse(raw).map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("{raw}: {e}"),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("expected scheme {}, got '{}'", schemes.join("/"), url.scheme()),
        });
    }
    Ok(url)
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "carelink", "carelink").map_or_else(
        || PathBuf::from(".carelink").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load from the canonical config path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` (missing file is fine) + environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CARELINK_").split("__"))
        .extract()?;
    Ok(config)
}

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

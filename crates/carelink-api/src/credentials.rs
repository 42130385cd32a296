use std::sync::RwLock;

use secrecy::SecretString;
use tracing::debug;

/// Where the current session token and user descriptor live.
///
/// Pure data access. The coordinator only ever calls [`token`](Self::token)
/// to build the `Authorization` header and [`clear`](Self::clear) on an
/// authentication failure; the realtime manager additionally reads
/// [`user_id`](Self::user_id) for its handshake payload.
pub trait CredentialStore: Send + Sync {
    /// The opaque session token, if signed in.
    fn token(&self) -> Option<SecretString>;

    /// The signed-in user's identifier, if known.
    fn user_id(&self) -> Option<String>;

    /// Forget the session.
    fn clear(&self);
}

#[derive(Debug, Clone)]
struct Session {
    token: SecretString,
    user_id: Option<String>,
}

/// In-process credential store.
///
/// Suitable for tests and for hosts that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: RwLock<Option<Session>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a session.
    pub fn with_session(token: impl Into<String>, user_id: Option<String>) -> Self {
        let store = Self::new();
        store.set(token, user_id);
        store
    }

    /// Replace the stored session.
    pub fn set(&self, token: impl Into<String>, user_id: Option<String>) {
        let session = Session {
            token: SecretString::from(token.into()),
            user_id,
        };
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session);
    }

    fn read(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<SecretString> {
        self.read().map(|s| s.token)
    }

    fn user_id(&self) -> Option<String> {
        self.read().and_then(|s| s.user_id)
    }

    fn clear(&self) {
        debug!("clearing stored session");
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use carelink_api::CredentialStore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::ConfigError;

const SERVICE: &str = "carelink";

/// [`CredentialStore`] backed by the system keyring.
///
/// The token lives at service `carelink`, user `<profile>/token`. It is
/// read lazily and cached; [`clear`](CredentialStore::clear) deletes the
/// keyring entry as well as the cache. After a clear the store reports no
/// token until [`store`](Self::store) is called, even if the delete failed.
pub struct KeyringCredentialStore {
    entry: keyring::Entry,
    user_id: Option<String>,
    cached: RwLock<Option<SecretString>>,
    cleared: AtomicBool,
}

impl KeyringCredentialStore {
    pub fn new(profile: &str, user_id: Option<String>) -> Result<Self, ConfigError> {
        let entry = keyring::Entry::new(SERVICE, &format!("{profile}/token"))?;
        Ok(Self {
            entry,
            user_id,
            cached: RwLock::new(None),
            cleared: AtomicBool::new(false),
        })
    }

    /// Persist a new session token.
    pub fn store(&self, token: SecretString) -> Result<(), ConfigError> {
        self.entry.set_password(token.expose_secret())?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        self.cleared.store(false, Ordering::Release);
        Ok(())
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn token(&self) -> Option<SecretString> {
        if self.cleared.load(Ordering::Acquire) {
            return None;
        }
        if let Some(token) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Some(token);
        }
        match self.entry.get_password() {
            Ok(secret) => {
                let token = SecretString::from(secret);
                *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
                Some(token)
            }
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(error = %e, "could not read session token from keyring");
                None
            }
        }
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => debug!("session token removed from keyring"),
            Err(e) => warn!(error = %e, "could not remove session token from keyring"),
        }
    }
}

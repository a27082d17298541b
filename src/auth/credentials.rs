use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keyring::Entry;
use tracing::debug;

const KEYRING_SERVICE: &str = "arena-chat";

/// The three credentials the client persists between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Bearer credential of a signed-in user.
    Access,
    /// Long-lived credential exchanged for a new access credential.
    Refresh,
    /// Credential of an anonymous, not signed-in visitor.
    Anonymous,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 3] = [
        CredentialKind::Access,
        CredentialKind::Refresh,
        CredentialKind::Anonymous,
    ];

    /// Storage key for this credential.
    pub fn key(self) -> &'static str {
        match self {
            CredentialKind::Access => "access_token",
            CredentialKind::Refresh => "refresh_token",
            CredentialKind::Anonymous => "anonymous_token",
        }
    }
}

/// Failure talking to the platform keyring.
///
/// Recoverable errors mean the backend was temporarily unavailable (a locked
/// keychain, no secret service running); permanent errors carry the cause.
#[derive(Debug, Clone)]
pub enum CredentialError {
    Recoverable(Arc<keyring::Error>),
    Permanent(Arc<keyring::Error>),
}

impl CredentialError {
    fn inner(&self) -> &keyring::Error {
        match self {
            CredentialError::Recoverable(err) | CredentialError::Permanent(err) => err,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, CredentialError::Recoverable(_))
    }
}

impl From<keyring::Error> for CredentialError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                CredentialError::Recoverable(Arc::new(err))
            }
            other => CredentialError::Permanent(Arc::new(other)),
        }
    }
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential storage error: {}", self.inner())
    }
}

impl Error for CredentialError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner())
    }
}

/// Durable credential storage shared by every clone.
///
/// With the keyring enabled, values are read through to the OS keyring once
/// and cached; with it disabled the cache is the only storage, which keeps
/// tests and `--no-keyring` runs away from the user's real secrets.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    use_keyring: bool,
    cache: Arc<Mutex<HashMap<CredentialKind, Option<String>>>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::new_with_keyring(true)
    }

    pub fn new_with_keyring(use_keyring: bool) -> Self {
        Self {
            use_keyring,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// An isolated store that never touches the keyring.
    pub fn in_memory() -> Self {
        Self::new_with_keyring(false)
    }

    pub fn uses_keyring(&self) -> bool {
        self.use_keyring
    }

    pub fn get(&self, kind: CredentialKind) -> Result<Option<String>, CredentialError> {
        if let Some(cached) = self.lock().get(&kind) {
            return Ok(cached.clone());
        }
        if !self.use_keyring {
            return Ok(None);
        }

        let entry = Entry::new(KEYRING_SERVICE, kind.key())?;
        let value = match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(err) => return Err(err.into()),
        };
        debug!(key = kind.key(), present = value.is_some(), "keyring lookup");
        self.lock().insert(kind, value.clone());
        Ok(value)
    }

    pub fn set(&self, kind: CredentialKind, value: &str) -> Result<(), CredentialError> {
        if self.use_keyring {
            Entry::new(KEYRING_SERVICE, kind.key())?.set_password(value)?;
        }
        self.lock().insert(kind, Some(value.to_string()));
        Ok(())
    }

    /// Removes one credential. Returns whether anything was stored.
    pub fn remove(&self, kind: CredentialKind) -> Result<bool, CredentialError> {
        let cached = self.lock().insert(kind, None);
        if !self.use_keyring {
            return Ok(matches!(cached, Some(Some(_))));
        }
        match Entry::new(KEYRING_SERVICE, kind.key())?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes all three credentials, attempting each even if one fails.
    pub fn clear(&self) -> Result<(), CredentialError> {
        let mut first_error = None;
        for kind in CredentialKind::ALL {
            if let Err(err) = self.remove(kind) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CredentialKind, Option<String>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

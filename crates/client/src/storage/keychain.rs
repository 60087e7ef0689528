//! Keychain storage for gateway bearer tokens.
//!
//! Tokens are kept in the platform keychain through the `keyring` crate
//! (macOS/iOS Keychain, Windows Credential Manager, Secret Service on Linux),
//! one entry per gateway host.

use thiserror::Error;

/// The service name used for keychain entries.
const SERVICE_NAME: &str = "termgate";

/// Prefix of the per-host entry name.
const TOKEN_KEY_PREFIX: &str = "bearer-token";

/// Errors that can occur during keychain operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeychainError {
    /// The requested entry was not found.
    #[error("Token not found in keychain: {0}")]
    NotFound(String),

    /// Access to the keychain was denied.
    #[error("Keychain access denied: {0}")]
    AccessDenied(String),

    /// The keychain service is unavailable.
    #[error("Keychain service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The value could not be stored as given.
    #[error("Token encoding error: {0}")]
    EncodingError(String),

    /// A platform-specific keychain error occurred.
    #[error("Keychain error: {0}")]
    PlatformError(String),
}

/// Result type for keychain operations.
pub type KeychainResult<T> = Result<T, KeychainError>;

/// Raw secret storage, abstracted so tests can run without a keychain.
pub trait KeychainBackend: Send + Sync {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String>;

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()>;

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()>;
}

/// Backend using the system keychain.
#[cfg(not(test))]
pub struct SystemKeychain;

#[cfg(not(test))]
fn map_keyring_error(key: &str, e: keyring::Error) -> KeychainError {
    match e {
        keyring::Error::NoEntry => KeychainError::NotFound(key.to_string()),
        keyring::Error::NoStorageAccess(_) => {
            KeychainError::AccessDenied("No storage access".to_string())
        }
        keyring::Error::PlatformFailure(_) => {
            KeychainError::ServiceUnavailable("Platform failure".to_string())
        }
        keyring::Error::TooLong(_, _) => KeychainError::EncodingError("Value too long".to_string()),
        keyring::Error::Invalid(_, _) => {
            KeychainError::EncodingError("Invalid entry attributes".to_string())
        }
        other => KeychainError::PlatformError(other.to_string()),
    }
}

#[cfg(not(test))]
impl KeychainBackend for SystemKeychain {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String> {
        keyring::Entry::new(service, key)
            .and_then(|entry| entry.get_password())
            .map_err(|e| map_keyring_error(key, e))
    }

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()> {
        keyring::Entry::new(service, key)
            .and_then(|entry| entry.set_password(value))
            .map_err(|e| map_keyring_error(key, e))
    }

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()> {
        keyring::Entry::new(service, key)
            .and_then(|entry| entry.delete_credential())
            .map_err(|e| map_keyring_error(key, e))
    }
}

/// In-memory backend for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MockKeychain {
    storage: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl KeychainBackend for MockKeychain {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String> {
        self.storage
            .lock()
            .unwrap()
            .get(&format!("{}:{}", service, key))
            .cloned()
            .ok_or_else(|| KeychainError::NotFound(key.to_string()))
    }

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()> {
        self.storage
            .lock()
            .unwrap()
            .insert(format!("{}:{}", service, key), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()> {
        match self
            .storage
            .lock()
            .unwrap()
            .remove(&format!("{}:{}", service, key))
        {
            Some(_) => Ok(()),
            None => Err(KeychainError::NotFound(key.to_string())),
        }
    }
}

/// Bearer tokens keyed by gateway host.
pub struct TokenStore<B: KeychainBackend> {
    backend: B,
    service: String,
}

impl<B: KeychainBackend> TokenStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Uses a custom service name, keeping separate profiles apart.
    pub fn with_service(backend: B, service: impl Into<String>) -> Self {
        Self {
            backend,
            service: service.into(),
        }
    }

    fn key_for(host: &str) -> String {
        format!("{}:{}", TOKEN_KEY_PREFIX, host.trim().to_ascii_lowercase())
    }

    /// Returns the stored token for `host`, or `None` when there is none.
    pub fn get(&self, host: &str) -> KeychainResult<Option<String>> {
        match self.backend.get_secret(&self.service, &Self::key_for(host)) {
            Ok(token) => Ok(Some(token)),
            Err(KeychainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stores `token` for `host`, replacing any previous value.
    pub fn set(&self, host: &str, token: &str) -> KeychainResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(KeychainError::EncodingError("empty token".to_string()));
        }
        self.backend
            .set_secret(&self.service, &Self::key_for(host), token)?;
        tracing::debug!(host = %host, "Stored bearer token");
        Ok(())
    }

    /// Removes the token for `host`. Removing a missing token succeeds.
    pub fn delete(&self, host: &str) -> KeychainResult<()> {
        match self
            .backend
            .delete_secret(&self.service, &Self::key_for(host))
        {
            Ok(()) | Err(KeychainError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(not(test))]
impl TokenStore<SystemKeychain> {
    /// Token store backed by the system keychain.
    pub fn system() -> Self {
        Self::new(SystemKeychain)
    }
}

//! Bearer-token authentication for connection upgrades.
//!
//! The shared secret lives in a [`SecretStore`] (by default a mode-0600 file)
//! and is loaded exactly once by a [`TokenProvider`] owned by the gateway.
//! Every upgrade request must carry `Authorization: Bearer <token>`; a
//! mismatch is answered with HTTP 401 before the WebSocket handshake
//! completes, so authentication failures never surface as wire messages.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderMap};

use crate::config::{ensure_owner_only, ConfigError};

/// Per-request authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No Authorization header was sent.
    #[error("missing Authorization header")]
    MissingHeader,

    /// The header is not of the form `Bearer <token>`.
    #[error("malformed Authorization header")]
    MalformedHeader,

    /// The presented token does not match.
    #[error("invalid bearer token")]
    InvalidToken,

    /// The gateway has no token loaded.
    #[error("no bearer token loaded")]
    NotInitialized,
}

/// Persistence for the bearer credential.
pub trait SecretStore: Send + Sync {
    /// Returns the raw stored secret.
    fn get(&self) -> Result<String, ConfigError>;

    /// Replaces the stored secret.
    fn set(&self, secret: &str) -> Result<(), ConfigError>;

    /// Removes the stored secret. Removing a missing secret succeeds.
    fn delete(&self) -> Result<(), ConfigError>;
}

/// Stores the secret in a file readable by its owner only.
#[derive(Debug, Clone)]
pub struct TokenFileStore {
    path: PathBuf,
}

impl TokenFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for TokenFileStore {
    fn get(&self) -> Result<String, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::TokenFileMissing(self.path.clone()));
        }

        ensure_owner_only(&self.path)?;

        fs::read_to_string(&self.path).map_err(|e| ConfigError::TokenUnreadable(e.to_string()))
    }

    fn set(&self, secret: &str) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::TokenUnreadable(e.to_string()))?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| ConfigError::TokenUnreadable(e.to_string()))?;

        // `mode` only applies on creation.
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .map_err(|e| ConfigError::TokenUnreadable(e.to_string()))?;

        writeln!(file, "{}", secret).map_err(|e| ConfigError::TokenUnreadable(e.to_string()))
    }

    fn delete(&self) -> Result<(), ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::TokenUnreadable(e.to_string())),
        }
    }
}

/// The shared secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Validates a raw secret: surrounding whitespace is trimmed and the rest
    /// must be at least 32 bytes.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(ConfigError::TokenEmpty);
        }
        if token.len() < protocol::MIN_TOKEN_BYTES {
            return Err(ConfigError::TokenTooShort(token.len()));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken([REDACTED; {} bytes])", self.0.len())
    }
}

/// Generates a fresh secret: 32 random bytes, hex-encoded.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Returns the token in a `Bearer <token>` header value, or `None` for any
/// other shape.
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    let mut parts = header?.split(' ');
    let scheme = parts.next()?;
    let token = parts.next()?;

    if parts.next().is_some() || scheme != "Bearer" || token.is_empty() {
        return None;
    }
    Some(token)
}

/// Compares `provided` against `expected` in constant time. Inputs of
/// different length are rejected before any byte is compared.
pub fn verify_token(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Loads the bearer token once and checks requests against it.
pub struct TokenProvider {
    store: Box<dyn SecretStore>,
    token: OnceLock<BearerToken>,
}

impl TokenProvider {
    pub fn new(store: impl SecretStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            token: OnceLock::new(),
        }
    }

    /// Loads and validates the token on first call; later calls return the
    /// cached value without touching the store.
    pub fn init(&self) -> Result<&BearerToken, ConfigError> {
        if let Some(token) = self.token.get() {
            return Ok(token);
        }

        let token = BearerToken::parse(&self.store.get()?)?;
        tracing::info!(bytes = token.len(), "Bearer token loaded");
        Ok(self.token.get_or_init(|| token))
    }

    /// The cached token, if `init` has succeeded.
    pub fn token(&self) -> Option<&BearerToken> {
        self.token.get()
    }

    /// Whether `provided` matches the loaded token.
    pub fn verify(&self, provided: &str) -> bool {
        match self.token.get() {
            Some(token) => verify_token(token.as_bytes(), provided.as_bytes()),
            None => false,
        }
    }

    /// Checks the Authorization header of an upgrade request.
    pub fn authenticate_request(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if self.token.get().is_none() {
            return Err(AuthError::NotInitialized);
        }

        let header = match headers.get(AUTHORIZATION) {
            Some(value) => value.to_str().map_err(|_| AuthError::MalformedHeader)?,
            None => return Err(AuthError::MissingHeader),
        };

        let provided = extract_bearer_token(Some(header)).ok_or(AuthError::MalformedHeader)?;

        if self.verify(provided) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("loaded", &self.token.get().is_some())
            .finish()
    }
}

//! Secure storage for gateway credentials.
//!
//! Bearer tokens live in the platform keychain, one entry per gateway host.
//! Non-secret connection settings are the caller's business.

pub mod keychain;

#[cfg(not(test))]
pub use keychain::SystemKeychain;
pub use keychain::{KeychainBackend, KeychainError, KeychainResult, TokenStore};

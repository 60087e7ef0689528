//! Configuration management for the termgate gateway.
//!
//! This module provides TOML-based configuration loading with environment
//! overrides. The default configuration path is
//! `~/.config/termgate/config.toml`. A config file that exists must not be
//! readable by anyone but its owner.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration and secret validation errors. All of them are fatal at
/// startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(String),

    #[error("host must be a non-empty string")]
    EmptyHost,

    #[error(
        "invalid listen host: {0} (must be loopback, an overlay address in 100.64.0.0/10, or 0.0.0.0)"
    )]
    InvalidListenHost(String),

    #[error("shell must be a non-empty string")]
    EmptyShell,

    #[error("token_file must be a non-empty path")]
    EmptyTokenFile,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("insecure permissions on {path}: {mode:o} (expected 600); run: chmod 600 {path}")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("token file not found: {0}; run: termgate generate-token")]
    TokenFileMissing(PathBuf),

    #[error("token file is empty")]
    TokenEmpty,

    #[error("token is too short: {0} bytes (minimum {min} bytes required)", min = protocol::MIN_TOKEN_BYTES)]
    TokenTooShort(usize),

    #[error("failed to read token: {0}")]
    TokenUnreadable(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8765;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener settings.
    pub server: ServerConfig,

    /// Shell spawning settings.
    pub shell: ShellConfig,

    /// Bearer credential settings.
    pub auth: AuthConfig,

    /// Console and audit logging.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. Must be loopback or on the overlay network.
    pub host: String,

    /// Port to bind.
    pub port: u16,
}

/// Shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell to run: absolute path, `~/`-relative path, or bare name looked up in PATH.
    pub path: String,

    /// Preferred working directory. Falls back to HOME when missing.
    pub cwd: Option<PathBuf>,

    /// Run the shell on plain pipes when PTY allocation fails.
    pub allow_non_pty_fallback: bool,
}

/// Bearer credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// File holding the shared secret. Must be mode 0600.
    pub token_file: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory receiving `audit.log`.
    pub log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: default_shell(),
            cwd: None,
            allow_non_pty_fallback: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: home_dir().join(".terminal-gateway-token"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: home_dir().join(".terminal-gateway"),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

/// Returns the default shell for the current user.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// HOME from the environment, then the platform lookup, then `/`.
pub(crate) fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Expands a leading `~/` against HOME.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) if path.to_string_lossy().starts_with("~/") => home_dir().join(rest),
        _ => path.to_path_buf(),
    }
}

/// Fails unless `path` is accessible to its owner only (mode 0600).
pub fn ensure_owner_only(path: &Path) -> Result<(), ConfigError> {
    let metadata =
        fs::metadata(path).map_err(|e| ConfigError::TokenUnreadable(e.to_string()))?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// Checks that the listen host keeps the gateway off public interfaces.
///
/// Loopback and overlay-network (CGNAT 100.64.0.0/10, or the overlay's
/// fd7a:115c:a1e0::/48 IPv6 range) addresses are accepted. The unspecified
/// address is accepted with a warning.
pub fn validate_listen_host(host: &str) -> Result<(), ConfigError> {
    if host == "localhost" {
        return Ok(());
    }

    let ip: IpAddr = host
        .parse()
        .map_err(|_| ConfigError::InvalidListenHost(host.to_string()))?;

    if ip.is_loopback() {
        return Ok(());
    }

    if ip.is_unspecified() {
        tracing::warn!(
            host = %host,
            "Listening on all interfaces; make sure the overlay network ACLs restrict access"
        );
        return Ok(());
    }

    let on_overlay = match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 100 && (octets[1] & 0xc0) == 64
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            segments[0] == 0xfd7a && segments[1] == 0x115c && segments[2] == 0xa1e0
        }
    };

    if on_overlay {
        Ok(())
    } else {
        Err(ConfigError::InvalidListenHost(host.to_string()))
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - GATEWAY_HOST, GATEWAY_PORT, GATEWAY_SHELL, GATEWAY_TOKEN_FILE
    /// - ALLOW_NON_PTY_FALLBACK: `true` enables the pipe fallback
    /// - TERMGATE_LOG_LEVEL: Override log level
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = non_empty_env("GATEWAY_HOST") {
            tracing::info!("Overriding host from environment: {}", host);
            self.server.host = host;
        }

        if let Some(port) = non_empty_env("GATEWAY_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
            tracing::info!("Overriding port from environment: {}", self.server.port);
        }

        if let Some(shell) = non_empty_env("GATEWAY_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.shell.path = shell;
        }

        if let Some(token_file) = non_empty_env("GATEWAY_TOKEN_FILE") {
            self.auth.token_file = expand_home(Path::new(&token_file));
        }

        if let Some(flag) = non_empty_env("ALLOW_NON_PTY_FALLBACK") {
            self.shell.allow_non_pty_fallback = flag == "true";
        }

        if let Some(level) = non_empty_env("TERMGATE_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port.to_string()));
        }

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        validate_listen_host(self.server.host.trim())?;

        if self.shell.path.trim().is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        if self.auth.token_file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTokenFile);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration. An
    /// existing file must be mode 0600.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        ensure_owner_only(path)?;

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.expand_paths();
        Ok(config)
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    fn expand_paths(&mut self) {
        self.auth.token_file = expand_home(&self.auth.token_file);
        self.logging.log_dir = expand_home(&self.logging.log_dir);
        self.shell.cwd = self.shell.cwd.as_deref().map(expand_home);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

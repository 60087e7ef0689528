//! Connection target: where the gateway is and how to authenticate.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 8765;

/// Reasons a target is rejected before any network attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("token must not be empty")]
    EmptyToken,

    #[error("invalid gateway address: {0}")]
    InvalidAddress(String),
}

/// A gateway to connect to.
///
/// The token is never serialized; it belongs in the keychain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing, default)]
    pub token: String,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    /// Checks that host, port and token are usable.
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.host.trim().is_empty() {
            return Err(TargetError::EmptyHost);
        }
        if self.port == 0 {
            return Err(TargetError::InvalidPort);
        }
        if self.token.trim().is_empty() {
            return Err(TargetError::EmptyToken);
        }
        Ok(())
    }

    /// `ws://host:port/terminal`, with IPv6 literals bracketed.
    pub fn ws_url(&self) -> Result<Url, TargetError> {
        let host = self.host.trim();
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        let raw = format!("ws://{}:{}{}", host, self.port, protocol::TERMINAL_PATH);
        Url::parse(&raw).map_err(|e| TargetError::InvalidAddress(format!("{}: {}", raw, e)))
    }

    /// Whether the host looks like an overlay-network address: CGNAT
    /// 100.64.0.0/10, the overlay IPv6 range, a `.ts.net` name, or loopback.
    pub fn is_overlay_host(&self) -> bool {
        let host = self
            .host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();

        if host == "localhost" || host.ends_with(".ts.net") {
            return true;
        }

        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                let octets = v4.octets();
                v4.is_loopback() || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
            }
            Ok(IpAddr::V6(v6)) => {
                let segments = v6.segments();
                v6.is_loopback()
                    || (segments[0] == 0xfd7a && segments[1] == 0x115c && segments[2] == 0xa1e0)
            }
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16, token: &str) -> ConnectionTarget {
        ConnectionTarget::new(host, port, token)
    }

    #[test]
    fn test_validate() {
        assert_eq!(target("100.64.0.1", 8765, "tok").validate(), Ok(()));
        assert_eq!(
            target("  ", 8765, "tok").validate(),
            Err(TargetError::EmptyHost)
        );
        assert_eq!(
            target("host", 0, "tok").validate(),
            Err(TargetError::InvalidPort)
        );
        assert_eq!(
            target("host", 65535, "").validate(),
            Err(TargetError::EmptyToken)
        );
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(
            target("100.64.0.1", 8765, "t").ws_url().unwrap().as_str(),
            "ws://100.64.0.1:8765/terminal"
        );
        assert_eq!(
            target("fd7a:115c:a1e0::1", 9000, "t")
                .ws_url()
                .unwrap()
                .as_str(),
            "ws://[fd7a:115c:a1e0::1]:9000/terminal"
        );
        assert!(target("bad host", 1, "t").ws_url().is_err());
    }

    #[test]
    fn test_overlay_detection() {
        assert!(target("100.100.1.2", 1, "t").is_overlay_host());
        assert!(target("mac.tail1234.ts.net", 1, "t").is_overlay_host());
        assert!(target("127.0.0.1", 1, "t").is_overlay_host());
        assert!(target("localhost", 1, "t").is_overlay_host());
        assert!(!target("192.168.1.20", 1, "t").is_overlay_host());
        assert!(!target("100.128.0.1", 1, "t").is_overlay_host());
        assert!(!target("example.com", 1, "t").is_overlay_host());
    }

    #[test]
    fn test_token_not_serialized_or_printed() {
        let t = target("100.64.0.1", 8765, "super-secret");

        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!format!("{:?}", t).contains("super-secret"));

        let back: ConnectionTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, "100.64.0.1");
        assert!(back.token.is_empty());
    }
}

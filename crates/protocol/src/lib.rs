//! # Termgate Protocol Library
//!
//! Shared definitions for the terminal gateway: the JSON wire messages, the
//! close codes that end a session, terminal geometry, and the timing limits
//! both sides agree on.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{WireMessage, TerminalSize};
//!
//! let msg = WireMessage::resize(120, 40);
//! let json = msg.to_json().unwrap();
//! assert_eq!(WireMessage::decode(&json).unwrap(), msg);
//!
//! assert!(!TerminalSize::new(20, 5).meets_floor());
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: The `WireMessage` tagged union and its codec
//! - [`close`]: Close codes and reason strings
//! - [`terminal`]: Geometry and the resize floor
//! - [`error`]: Error types

use std::time::Duration;

pub mod close;
pub mod error;
pub mod messages;
pub mod terminal;

pub use error::{ProtocolError, Result};
pub use messages::{unix_millis, WireMessage, MESSAGE_TYPES};
pub use terminal::{TerminalSize, DEFAULT_COLS, DEFAULT_ROWS, MIN_COLS, MIN_ROWS};

/// Interval at which each side emits its own heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence the gateway tolerates since the last client heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Minimum length of the shared bearer credential, in bytes.
pub const MIN_TOKEN_BYTES: usize = 32;

/// Concurrent sessions a gateway process admits.
pub const MAX_SESSIONS: usize = 1;

/// Path the gateway serves the terminal on.
pub const TERMINAL_PATH: &str = "/terminal";

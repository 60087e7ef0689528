//! # Termgate Client Library
//!
//! Client-side core for talking to a termgate gateway: connection target
//! validation, bearer-token storage, the reconnecting connection manager
//! and the stream sanitizer that repairs terminal state between the
//! network and the renderer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    UI / terminal renderer                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ClientEvent::Output (sanitized)      commands (input, size) │
//! │                 ▲                              │             │
//! │  ┌──────────────┴──────────────────────────────▼──────────┐  │
//! │  │ ConnectionManager task                                 │  │
//! │  │   state machine · backoff · heartbeat · resize timers  │  │
//! │  │   StreamSanitizer                                      │  │
//! │  └──────────────┬─────────────────────────────────────────┘  │
//! │                 │ Transport (WebSocket + Bearer token)       │
//! └─────────────────┼────────────────────────────────────────────┘
//!                   ▼
//!               gateway
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use client::{ClientConfig, ConnectionManager, ConnectionTarget, WebSocketTransport};
//!
//! # async fn run() -> Result<(), client::ClientError> {
//! let manager = ConnectionManager::spawn(WebSocketTransport::new(), ClientConfig::default());
//! let mut events = manager.subscribe();
//!
//! manager
//!     .connect(ConnectionTarget::new("100.101.102.103", 8765, "token"))
//!     .await?;
//! manager.send_input("uptime\n").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod connection;
pub mod sanitizer;
pub mod storage;
pub mod target;

pub use backoff::{Backoff, ReconnectPolicy};
pub use connection::{
    ClientConfig, ClientError, ClientEvent, ConnectionManager, ConnectionState, Link, LinkEvent,
    Transport, TransportError, Viewport, WebSocketTransport,
};
pub use sanitizer::{SanitizedChunk, SanitizerPolicy, StreamSanitizer};
pub use storage::{KeychainBackend, KeychainError, TokenStore};
pub use target::{ConnectionTarget, TargetError};

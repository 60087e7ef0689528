//! # Termgate Gateway Library
//!
//! Host side of the terminal gateway: bridges one remote operator to one
//! PTY-backed shell over an authenticated WebSocket.
//!
//! ## Overview
//!
//! - **Auth Gate**: bearer-token check on the upgrade request, answered with
//!   HTTP 401 before the handshake completes
//! - **Admission**: a hard limit of one concurrent session
//! - **PTY Supervisor**: shell, environment and working-directory resolution,
//!   spawning, resize and kill
//! - **Session Handler**: message dispatch, heartbeats and liveness, shutdown
//!
//! ## Architecture
//!
//! ```text
//!   client ──ws──▶ Gateway ──▶ TokenProvider (401 on failure)
//!                     │
//!                     ├──▶ AdmissionController (1008 when full)
//!                     │
//!                     └──▶ run_session ◀──events── PtySupervisor ── shell
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gateway::{Config, Gateway, PtySupervisor, SpawnOptions, TokenFileStore, TokenProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let auth = TokenProvider::new(TokenFileStore::new(&config.auth.token_file));
//!     let spawner = Arc::new(PtySupervisor::new(SpawnOptions::from(&config)));
//!
//!     let gateway = Gateway::new(config, auth, spawner);
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, overrides and validation
//! - [`auth`]: Secret store, token provider and header checks
//! - [`admission`]: Session slot accounting
//! - [`session`]: PTY supervisor and per-connection protocol handler
//! - [`server`]: Listener, connection setup and shutdown draining
//! - [`logging`]: Console and audit log setup

pub mod admission;
pub mod auth;
pub mod config;
pub mod logging;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use admission::{AdmissionController, AdmissionError, SessionPermit};
pub use auth::{
    extract_bearer_token, generate_token, verify_token, AuthError, BearerToken, SecretStore,
    TokenFileStore, TokenProvider,
};
pub use config::{Config, ConfigError};
pub use server::{Gateway, GatewayError, GatewayEvent, DRAIN_TIMEOUT};
pub use session::{
    run_session, DisconnectReason, ExitInfo, LaunchPlan, PtyError, PtyEvent, PtySupervisor,
    SessionContext, SessionOutcome, ShellHandle, ShellSpawner, SpawnOptions, SpawnedShell,
};

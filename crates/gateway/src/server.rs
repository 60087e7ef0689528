//! WebSocket listener.
//!
//! Accepts TCP connections, authenticates the upgrade request, admits at
//! most one session, spawns its shell and hands both to the session
//! handler. Every connection task is tracked so shutdown can wait for the
//! sessions to drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::close::{self, GOING_AWAY, INTERNAL_ERROR, POLICY_VIOLATION};
use protocol::{TerminalSize, WireMessage};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionError};
use crate::auth::{AuthError, TokenProvider};
use crate::config::{Config, ConfigError};
use crate::session::handler::reject;
use crate::session::{run_session, DisconnectReason, SessionContext, ShellSpawner};

/// Time a client gets to complete the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time sessions get to close after shutdown begins.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Gateway lifecycle failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid configuration or bearer token.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Sessions were still open when the drain deadline passed.
    #[error("sessions did not drain within {0:?}")]
    DrainTimeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The listener is bound.
    Listening(SocketAddr),
    /// An upgrade request failed authentication.
    AuthRejected { peer: SocketAddr, error: AuthError },
    /// A connection arrived while the session slot was taken.
    CapacityRejected { peer: SocketAddr },
    /// The shell could not be spawned.
    SpawnFailed { peer: SocketAddr, message: String },
    /// A session began.
    SessionStarted { peer: SocketAddr },
    /// A session ended.
    SessionEnded {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
    /// The listener closed.
    Stopped,
}

/// The terminal gateway.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<Config>,
    auth: Arc<TokenProvider>,
    admission: AdmissionController,
    spawner: Arc<dyn ShellSpawner>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    event_tx: broadcast::Sender<GatewayEvent>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl Gateway {
    /// Creates a gateway. The token provider must be initialised before
    /// [`serve`](Self::serve) is called; [`run`](Self::run) does it.
    pub fn new(config: Config, auth: TokenProvider, spawner: Arc<dyn ShellSpawner>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
            admission: AdmissionController::default(),
            spawner,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            event_tx,
            heartbeat_interval: protocol::HEARTBEAT_INTERVAL,
            heartbeat_timeout: protocol::HEARTBEAT_TIMEOUT,
        }
    }

    /// Overrides the heartbeat timings applied to new sessions.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auth(&self) -> &TokenProvider {
        &self.auth
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribes to gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Loads the token, binds the configured address and serves until
    /// shutdown begins.
    pub async fn run(&self) -> Result<(), GatewayError> {
        self.auth.init()?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        TcpListener::bind((self.config.server.host.as_str(), self.config.server.port))
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Accepts connections on `listener` until shutdown begins.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let addr = listener.local_addr()?;
        info!(target: "audit", %addr, "Server started on {}", addr);
        self.emit(GatewayEvent::Listening(addr));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        self.tracker.spawn(async move {
                            gateway.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!(target: "audit", "Server stopped");
        self.emit(GatewayEvent::Stopped);
        Ok(())
    }

    /// Begins shutdown and waits up to `drain` for every connection task to
    /// finish. Open sessions are closed with 1001 "Server shutdown".
    pub async fn shutdown(&self, drain: Duration) -> Result<(), GatewayError> {
        info!(
            active_sessions = self.admission.active(),
            "Shutting down gateway"
        );
        self.shutdown.cancel();
        self.admission.close();
        self.tracker.close();

        tokio::time::timeout(drain, self.tracker.wait())
            .await
            .map_err(|_| GatewayError::DrainTimeout(drain))
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Accepted TCP connection");

        let mut rejected: Option<AuthError> = None;
        let auth = Arc::clone(&self.auth);
        let callback = |request: &Request, response: Response| {
            match auth.authenticate_request(request.headers()) {
                Ok(()) => Ok(response),
                Err(e) => {
                    rejected = Some(e);
                    let mut reject = ErrorResponse::new(Some("Unauthorized".to_string()));
                    *reject.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(reject)
                }
            }
        };

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await;

        let ws = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                match rejected {
                    Some(error) => {
                        warn!(target: "audit", %peer, %error, "Connection failed from {}", peer.ip());
                        self.emit(GatewayEvent::AuthRejected { peer, error });
                    }
                    None => debug!(%peer, error = %e, "WebSocket handshake failed"),
                }
                // Dropping the stream destroys the socket.
                return;
            }
            Err(_) => {
                debug!(%peer, "WebSocket handshake timed out");
                return;
            }
        };

        let _permit = match self.admission.try_admit() {
            Ok(permit) => permit,
            Err(AdmissionError::CapacityExceeded { limit }) => {
                warn!(
                    target: "audit",
                    %peer,
                    limit,
                    "Connection rejected from {}: maximum connections reached",
                    peer.ip()
                );
                reject(ws, None, POLICY_VIOLATION, close::REASON_CAPACITY).await;
                self.emit(GatewayEvent::CapacityRejected { peer });
                return;
            }
            Err(AdmissionError::Closed) => {
                reject(ws, None, GOING_AWAY, close::REASON_SERVER_SHUTDOWN).await;
                return;
            }
        };

        info!(target: "audit", %peer, "Connection successful from {}", peer.ip());

        let shell = match self.spawner.spawn(TerminalSize::default()) {
            Ok(shell) => shell,
            Err(e) => {
                error!(%peer, code = e.code(), error = %e, "Failed to create terminal session");
                let notice = WireMessage::error(close::REASON_SPAWN_FAILED);
                reject(ws, Some(notice), INTERNAL_ERROR, close::REASON_SPAWN_FAILED).await;
                self.emit(GatewayEvent::SpawnFailed {
                    peer,
                    message: e.to_string(),
                });
                return;
            }
        };

        self.emit(GatewayEvent::SessionStarted { peer });

        let mut ctx = SessionContext::new(peer.to_string(), self.shutdown.clone());
        ctx.heartbeat_interval = self.heartbeat_interval;
        ctx.heartbeat_timeout = self.heartbeat_timeout;

        let outcome = run_session(ws, shell, ctx).await;
        self.emit(GatewayEvent::SessionEnded {
            peer,
            reason: outcome.reason,
        });
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("host", &self.config.server.host)
            .field("port", &self.config.server.port)
            .field("active_sessions", &self.admission.active())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

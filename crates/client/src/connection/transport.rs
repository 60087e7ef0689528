//! Transport seam between the connection manager and the network.
//!
//! A [`Transport`] turns a [`ConnectionTarget`] into a [`Link`]: a pair of
//! channels carrying decoded wire messages. [`WebSocketTransport`] is the
//! real implementation; tests substitute an in-memory one.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::WireMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::target::{ConnectionTarget, TargetError};

/// Default time allowed for the TCP connect plus WebSocket upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for link channels.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Failures while opening a link.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    InvalidTarget(#[from] TargetError),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway rejected the bearer token")]
    Unauthorized,

    #[error("connection failed: {0}")]
    Connect(String),
}

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A decoded message from the gateway.
    Message(WireMessage),
    /// The gateway closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The connection failed.
    Error(String),
}

/// An open connection. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::Sender<WireMessage>,
    pub incoming: mpsc::Receiver<LinkEvent>,
}

/// Future returned by [`Transport::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send + 'a>>;

/// Opens links to a gateway.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a ConnectionTarget) -> ConnectFuture<'a>;
}

/// WebSocket transport with bearer-token authentication.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect_internal(&self, target: &ConnectionTarget) -> Result<Link, TransportError> {
        target.validate()?;
        let url = target.ws_url()?;

        if !target.is_overlay_host() {
            tracing::warn!(
                host = %target.host,
                "Gateway host is outside the overlay network"
            );
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", target.token.trim()))
            .map_err(|_| TransportError::Connect("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::info!("Connecting to gateway: {}", url);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| match e {
                WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    TransportError::Unauthorized
                }
                other => TransportError::Connect(other.to_string()),
            })?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<WireMessage>(CHANNEL_BUFFER_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel::<LinkEvent>(CHANNEL_BUFFER_SIZE);

        // Writer: runs until the manager drops its sender, then closes.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match msg.to_json() {
                    Ok(json) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                            tracing::debug!("failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    Err(e) => tracing::error!("failed to serialize message: {}", e),
                }
            }
            let _ = ws_sink.close().await;
        });

        // Reader
        tokio::spawn(async move {
            loop {
                let event = match ws_stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => match WireMessage::decode(&text) {
                        Ok(msg) => LinkEvent::Message(msg),
                        Err(e) => {
                            tracing::warn!("dropping undecodable gateway message: {}", e);
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        let _ = incoming_tx.send(LinkEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = incoming_tx.send(LinkEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = incoming_tx
                            .send(LinkEvent::Closed {
                                code: None,
                                reason: "connection lost".to_string(),
                            })
                            .await;
                        break;
                    }
                };

                if incoming_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

impl Transport for WebSocketTransport {
    fn connect<'a>(&'a self, target: &'a ConnectionTarget) -> ConnectFuture<'a> {
        Box::pin(self.connect_internal(target))
    }
}

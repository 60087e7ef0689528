//! Session protocol handler.
//!
//! Drives one authenticated WebSocket against one shell until either side
//! goes away. Client frames, shell events, the outbound heartbeat, the
//! liveness deadline and the shutdown token share one `select!` loop.
//! Outbound frames go through a writer task, so a client that stops reading
//! only stalls shell output and never the timers. Timers live on this task's
//! stack; every exit path drops them together with the connection.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::close::{self, GOING_AWAY, NORMAL};
use protocol::{ProtocolError, TerminalSize, WireMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, Permit};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{ExitInfo, PtyEvent, ShellHandle, SpawnedShell};

/// Reply sent for frames that cannot be decoded at all.
const MALFORMED_REPLY: &str = "Failed to process message";

/// Frames queued for the writer before heartbeats and replies are dropped
/// and shell output waits.
const OUTBOUND_BUFFER: usize = 256;

/// Time the final frames get to reach a client before the socket is dropped.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Remote address, for logs.
    pub peer: String,
    /// Cancelled when the gateway shuts down.
    pub shutdown: CancellationToken,
    /// How often the gateway sends its own heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence tolerated since the last client heartbeat.
    pub heartbeat_timeout: Duration,
}

impl SessionContext {
    pub fn new(peer: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            peer: peer.into(),
            shutdown,
            heartbeat_interval: protocol::HEARTBEAT_INTERVAL,
            heartbeat_timeout: protocol::HEARTBEAT_TIMEOUT,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No client heartbeat within the timeout.
    HeartbeatTimeout,
    /// The gateway is shutting down.
    ServerShutdown,
    /// The shell exited.
    ProcessExited(ExitInfo),
    /// The client closed or the stream ended. `None` means no close frame.
    ClientClosed(Option<u16>),
    /// Reading from the socket failed.
    TransportError(String),
}

impl DisconnectReason {
    /// Audit description. Reasons chosen by the gateway take precedence over
    /// whatever close code the peer reported.
    pub fn audit_label(&self) -> String {
        match self {
            DisconnectReason::HeartbeatTimeout => close::REASON_HEARTBEAT_TIMEOUT.to_string(),
            DisconnectReason::ServerShutdown => close::REASON_SERVER_SHUTDOWN.to_string(),
            DisconnectReason::ProcessExited(info) => info.to_string(),
            DisconnectReason::ClientClosed(Some(NORMAL)) => "normal closure".to_string(),
            DisconnectReason::ClientClosed(Some(close::ABNORMAL))
            | DisconnectReason::ClientClosed(None)
            | DisconnectReason::TransportError(_) => "connection lost".to_string(),
            DisconnectReason::ClientClosed(Some(code)) => format!("closed with code {}", code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.audit_label())
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub reason: DisconnectReason,
    pub duration: Duration,
}

/// Effect of one decoded client frame.
#[derive(Debug, Default, PartialEq, Eq)]
struct Dispatched {
    reply: Option<WireMessage>,
    client_heartbeat: bool,
}

/// Runs a session to completion. The shell is killed before returning.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    shell: SpawnedShell,
    ctx: SessionContext,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let SpawnedShell {
        mut handle,
        mut events,
    } = shell;
    let started = Instant::now();
    let mut output = Utf8Carry::default();
    let mut shell_open = true;
    let mut farewell = Vec::new();

    let (sink, mut stream) = ws.split();
    let outbox = Outbox::spawn(sink);

    let mut heartbeat = interval_at(started + ctx.heartbeat_interval, ctx.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let liveness = sleep(ctx.heartbeat_timeout);
    tokio::pin!(liveness);

    tracing::info!(peer = %ctx.peer, pid = ?handle.pid(), "Session started");

    let reason = loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break DisconnectReason::ServerShutdown,

            _ = &mut liveness => {
                tracing::warn!(
                    target: "audit",
                    peer = %ctx.peer,
                    timeout_secs = ctx.heartbeat_timeout.as_secs(),
                    "Heartbeat timeout; closing connection"
                );
                break DisconnectReason::HeartbeatTimeout;
            }

            _ = heartbeat.tick() => outbox.push(&WireMessage::heartbeat_now()),

            (permit, event) = next_shell_event(&outbox.tx, &mut events), if shell_open => match event {
                Some(PtyEvent::Data(bytes)) => {
                    let text = output.push(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    if let (Some(permit), Some(frame)) = (permit, text_frame(&WireMessage::output(text))) {
                        permit.send(frame);
                    }
                }
                Some(PtyEvent::Exit(info)) => {
                    let rest = output.finish();
                    if !rest.is_empty() {
                        farewell.push(WireMessage::output(rest));
                    }
                    farewell.push(WireMessage::error(info.to_string()));
                    break DisconnectReason::ProcessExited(info);
                }
                None => {
                    tracing::warn!(peer = %ctx.peer, "Shell event stream closed without exit status");
                    shell_open = false;
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let dispatched = dispatch(handle.as_mut(), &text);
                    if dispatched.client_heartbeat {
                        liveness.as_mut().reset(Instant::now() + ctx.heartbeat_timeout);
                    }
                    if let Some(reply) = dispatched.reply {
                        outbox.push(&reply);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let dispatched = match String::from_utf8(bytes) {
                        Ok(text) => dispatch(handle.as_mut(), &text),
                        Err(_) => Dispatched {
                            reply: Some(WireMessage::error(MALFORMED_REPLY)),
                            client_heartbeat: false,
                        },
                    };
                    if dispatched.client_heartbeat {
                        liveness.as_mut().reset(Instant::now() + ctx.heartbeat_timeout);
                    }
                    if let Some(reply) = dispatched.reply {
                        outbox.push(&reply);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break DisconnectReason::ClientClosed(frame.map(|f| u16::from(f.code)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(peer = %ctx.peer, error = %e, "WebSocket read failed");
                    break DisconnectReason::TransportError(e.to_string());
                }
                None => break DisconnectReason::ClientClosed(None),
            },
        }
    };

    let mut frames: Vec<Message> = farewell.iter().filter_map(text_frame).collect();
    frames.extend(closing_frame(&reason));
    outbox.finish(frames).await;
    drop(stream);

    handle.kill();

    let duration = started.elapsed();
    tracing::info!(
        target: "audit",
        peer = %ctx.peer,
        reason = %reason,
        duration_secs = duration.as_secs(),
        "Client disconnected"
    );

    SessionOutcome { reason, duration }
}

/// Waits for room in the outbound queue, then for the next shell event.
/// The permit is `None` once the writer is gone.
async fn next_shell_event<'a>(
    outbound: &'a mpsc::Sender<Message>,
    events: &mut mpsc::Receiver<PtyEvent>,
) -> (Option<Permit<'a, Message>>, Option<PtyEvent>) {
    let permit = outbound.reserve().await.ok();
    (permit, events.recv().await)
}

/// Close frame the gateway sends for `reason`, if any.
fn closing_frame(reason: &DisconnectReason) -> Option<Message> {
    let (code, text) = match reason {
        DisconnectReason::HeartbeatTimeout => (GOING_AWAY, close::REASON_HEARTBEAT_TIMEOUT),
        DisconnectReason::ServerShutdown => (GOING_AWAY, close::REASON_SERVER_SHUTDOWN),
        DisconnectReason::ProcessExited(_) => (NORMAL, close::REASON_PROCESS_EXITED),
        // Flushes the close reply queued by tungstenite.
        DisconnectReason::ClientClosed(Some(_)) => return Some(Message::Close(None)),
        DisconnectReason::ClientClosed(None) | DisconnectReason::TransportError(_) => return None,
    };
    Some(close_message(code, text))
}

/// Applies one client frame to the shell.
fn dispatch(handle: &mut dyn ShellHandle, text: &str) -> Dispatched {
    match WireMessage::decode(text) {
        Ok(WireMessage::Input { data }) => {
            if !data.is_empty() {
                if let Err(e) = handle.write(data.as_bytes()) {
                    tracing::warn!(error = %e, "Failed to forward input to shell");
                }
            }
            Dispatched::default()
        }
        Ok(WireMessage::Resize { cols, rows }) => {
            let size = TerminalSize::new(cols, rows);
            if size.meets_floor() {
                if let Err(e) = handle.resize(size) {
                    tracing::warn!(error = %e, cols, rows, "Failed to resize shell");
                }
            } else {
                tracing::debug!(cols, rows, "Ignoring resize below floor");
            }
            Dispatched::default()
        }
        Ok(WireMessage::Heartbeat { .. }) => Dispatched {
            reply: Some(WireMessage::heartbeat_now()),
            client_heartbeat: true,
        },
        Ok(other) => {
            let err = ProtocolError::UnknownType(other.message_type().to_string());
            tracing::warn!(error = %err, "Unexpected message from client");
            Dispatched {
                reply: Some(WireMessage::error(err.to_string())),
                client_heartbeat: false,
            }
        }
        Err(err @ ProtocolError::UnknownType(_)) => {
            tracing::warn!(error = %err, "Unknown message from client");
            Dispatched {
                reply: Some(WireMessage::error(err.to_string())),
                client_heartbeat: false,
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to decode client message");
            Dispatched {
                reply: Some(WireMessage::error(MALFORMED_REPLY)),
                client_heartbeat: false,
            }
        }
    }
}

/// Outbound half of a session socket. Frames go through a bounded queue to
/// a writer task; the session loop never awaits the socket itself.
struct Outbox {
    tx: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
}

impl Outbox {
    fn spawn<S>(mut sink: SplitSink<WebSocketStream<S>, Message>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(error = %e, "Failed to send frame");
                    return;
                }
            }
            let _ = sink.close().await;
        });
        Self { tx, writer }
    }

    /// Queues `msg`, dropping it when the queue is full.
    fn push(&self, msg: &WireMessage) {
        let Some(frame) = text_frame(msg) else {
            return;
        };
        if let Err(e) = self.tx.try_send(frame) {
            tracing::debug!(kind = msg.message_type(), error = %e, "Dropping outbound message");
        }
    }

    /// Queues the last frames and gives the writer [`CLOSE_GRACE`] to flush
    /// them. A writer still blocked after that is aborted, which drops the
    /// connection.
    async fn finish(self, frames: Vec<Message>) {
        let Self { tx, mut writer } = self;
        let deadline = Instant::now() + CLOSE_GRACE;

        for frame in frames {
            if !matches!(timeout_at(deadline, tx.send(frame)).await, Ok(Ok(()))) {
                break;
            }
        }
        drop(tx);

        if timeout_at(deadline, &mut writer).await.is_err() {
            tracing::debug!("Client is not reading; dropping connection");
            writer.abort();
        }
    }
}

/// Encodes `msg` as a text frame, logging encoding failures.
fn text_frame(msg: &WireMessage) -> Option<Message> {
    match msg.to_json() {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode message");
            None
        }
    }
}

pub(crate) fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Borrowed(reason),
    }))
}

/// Turns away a connection that never gets a session: an optional error
/// message, then a close frame. Bounded by [`CLOSE_GRACE`].
pub(crate) async fn reject<S>(
    mut ws: WebSocketStream<S>,
    notice: Option<WireMessage>,
    code: u16,
    reason: &'static str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let farewell = async {
        if let Some(frame) = notice.as_ref().and_then(text_frame) {
            ws.feed(frame).await?;
        }
        ws.send(close_message(code, reason)).await
    };

    match tokio::time::timeout(CLOSE_GRACE, farewell).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(code, reason, error = %e, "Failed to send close frame"),
        Err(_) => tracing::debug!(code, reason, "Client is not reading; dropping connection"),
    }
}

/// Decodes shell output as UTF-8, holding back a trailing partial sequence
/// until the next chunk completes it.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes whatever is held back, replacing it if incomplete.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

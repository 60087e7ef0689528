//! Client connection manager.
//!
//! A single task owns the connection: the pending connect attempt, the open
//! link, the sanitizer and every timer. The [`ConnectionManager`] handle
//! talks to it over a command channel; state is published through a
//! `watch` channel and everything else through a `broadcast` of
//! [`ClientEvent`]s.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!                              ^                    |
//!                              |   (backoff)     error/close
//!                              +------ Error <------+
//!                                        |
//!                          budget spent  +--> Disconnected
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use protocol::{TerminalSize, WireMessage, HEARTBEAT_INTERVAL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use super::transport::{Link, LinkEvent, Transport, TransportError};
use crate::backoff::{Backoff, ReconnectPolicy};
use crate::sanitizer::{SanitizerPolicy, StreamSanitizer};
use crate::target::{ConnectionTarget, TargetError};

/// Quiet period before a viewport change is sent as a resize.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(120);

/// Delay before re-sending the geometry after input containing a newline.
pub const DEFAULT_NEWLINE_RESEND_DELAY: Duration = Duration::from_millis(300);

/// Delay before re-sending the geometry after the sanitizer asks for a redraw.
pub const DEFAULT_RECOVERY_REDRAW_DELAY: Duration = Duration::from_millis(150);

const COMMAND_BUFFER_SIZE: usize = 64;
const EVENT_BUFFER_SIZE: usize = 256;

/// Connection lifecycle as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Events published by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Sanitized shell output, ready for the renderer.
    Output(String),
    /// An `error` message from the gateway.
    ServerError(String),
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Errors returned by the manager handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid connection target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("connection manager has stopped")]
    Stopped,
}

/// Terminal viewport in pixels plus the size of one character cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub cell_width: f32,
    pub cell_height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32, cell_width: f32, cell_height: f32) -> Self {
        Self {
            width,
            height,
            cell_width,
            cell_height,
        }
    }

    /// Whole character cells that fit, or `None` for a degenerate layout.
    pub fn cells(&self) -> Option<TerminalSize> {
        if !(self.cell_width > 0.0 && self.cell_height > 0.0) {
            return None;
        }
        let cols = (self.width / self.cell_width).floor();
        let rows = (self.height / self.cell_height).floor();
        if !(cols >= 1.0 && rows >= 1.0) {
            return None;
        }
        Some(TerminalSize::new(
            cols.min(u16::MAX as f32) as u16,
            rows.min(u16::MAX as f32) as u16,
        ))
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub resize_debounce: Duration,
    pub newline_resend_delay: Duration,
    pub recovery_redraw_delay: Duration,
    pub sanitizer: SanitizerPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            newline_resend_delay: DEFAULT_NEWLINE_RESEND_DELAY,
            recovery_redraw_delay: DEFAULT_RECOVERY_REDRAW_DELAY,
            sanitizer: SanitizerPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_resize_debounce(mut self, debounce: Duration) -> Self {
        self.resize_debounce = debounce;
        self
    }

    pub fn with_sanitizer(mut self, policy: SanitizerPolicy) -> Self {
        self.sanitizer = policy;
        self
    }
}

#[derive(Debug)]
enum Command {
    Connect(ConnectionTarget),
    Disconnect,
    SendInput(String),
    SetViewport(Viewport),
    Resize(TerminalSize),
}

/// Handle to the connection task.
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Starts the connection task. Must be called inside a tokio runtime.
    pub fn spawn<T: Transport>(transport: T, config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let actor = Actor {
            transport: Arc::new(transport),
            backoff: Backoff::new(config.reconnect),
            sanitizer: StreamSanitizer::with_policy(config.sanitizer),
            config,
            state_tx,
            events: events.clone(),
            target: None,
            attempt: None,
            link: None,
            reconnect_enabled: false,
            timers: Timers::default(),
            last_size: None,
            pending_size: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            events,
            task,
        }
    }

    /// Connects to `target`, replacing any current connection. An invalid
    /// target moves the state to `Error` without dialing.
    pub async fn connect(&self, target: ConnectionTarget) -> Result<(), ClientError> {
        let validation = target.validate();
        self.command(Command::Connect(target)).await?;
        validation.map_err(ClientError::from)
    }

    /// Closes the connection and stops reconnecting.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect).await
    }

    /// Sends keystrokes to the shell. Dropped when not connected.
    pub async fn send_input(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::SendInput(data.into())).await
    }

    /// Reports a new viewport; the resulting resize is debounced.
    pub async fn set_viewport(&self, viewport: Viewport) -> Result<(), ClientError> {
        self.command(Command::SetViewport(viewport)).await
    }

    /// Sends a resize immediately.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), ClientError> {
        self.command(Command::Resize(size)).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Disconnects and waits for the connection task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Disconnect).await;
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::error!("connection task failed: {}", e);
        }
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

type Attempt = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send>>;

/// Scheduled work owned by the connection task.
#[derive(Default)]
struct Timers {
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    resize_debounce: Option<Pin<Box<Sleep>>>,
    newline_resend: Option<Pin<Box<Sleep>>>,
    recovery_redraw: Option<Pin<Box<Sleep>>>,
}

impl Timers {
    fn cancel_all(&mut self) {
        *self = Self::default();
    }
}

struct Actor<T> {
    transport: Arc<T>,
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    target: Option<ConnectionTarget>,
    attempt: Option<Attempt>,
    link: Option<Link>,
    backoff: Backoff,
    reconnect_enabled: bool,
    sanitizer: StreamSanitizer,
    timers: Timers,
    last_size: Option<TerminalSize>,
    pending_size: Option<TerminalSize>,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                result = settle(&mut self.attempt) => self.on_attempt(result),
                event = next_event(&mut self.link) => self.on_link_event(event),
                _ = expire(&mut self.timers.reconnect) => self.start_attempt(),
                _ = tick(&mut self.timers.heartbeat) => self.send(WireMessage::heartbeat_now()),
                _ = expire(&mut self.timers.resize_debounce) => self.flush_viewport(),
                _ = expire(&mut self.timers.newline_resend) => self.resend_size(),
                _ = expire(&mut self.timers.recovery_redraw) => self.resend_size(),
            }
        }

        self.stop();
        tracing::debug!("Connection task stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(target) => self.connect(target),
            Command::Disconnect => self.stop(),
            Command::SendInput(data) => self.send_input(data),
            Command::SetViewport(viewport) => match viewport.cells() {
                Some(size) => {
                    self.pending_size = Some(size);
                    self.timers.resize_debounce =
                        Some(Box::pin(sleep(self.config.resize_debounce)));
                }
                None => tracing::debug!(?viewport, "Ignoring degenerate viewport"),
            },
            Command::Resize(size) => {
                self.pending_size = None;
                self.timers.resize_debounce = None;
                self.apply_size(size);
            }
        }
    }

    fn connect(&mut self, target: ConnectionTarget) {
        self.drop_connection();
        self.backoff.reset();

        if let Err(e) = target.validate() {
            tracing::warn!(error = %e, "Refusing to connect");
            self.target = None;
            self.reconnect_enabled = false;
            self.set_state(ConnectionState::Error(e.to_string()));
            return;
        }

        self.target = Some(target);
        self.reconnect_enabled = self.config.reconnect.enabled;
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        self.drop_connection();

        let Some(target) = self.target.clone() else {
            return;
        };
        let transport = Arc::clone(&self.transport);

        self.set_state(ConnectionState::Connecting);
        self.attempt = Some(Box::pin(
            async move { transport.connect(&target).await },
        ));
    }

    fn on_attempt(&mut self, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.backoff.reset();
                self.sanitizer.reset();

                let period = self.config.heartbeat_interval;
                let mut heartbeat = interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.timers.heartbeat = Some(heartbeat);

                self.set_state(ConnectionState::Connected);
                tracing::info!("Connected to gateway");

                if let Some(size) = self.pending_size.take().or(self.last_size) {
                    self.apply_size(size);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connection attempt failed");
                self.fail(e.to_string());
            }
        }
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Message(WireMessage::Output { data })) => {
                let chunk = self.sanitizer.process(&data);
                if !chunk.text.is_empty() {
                    self.emit(ClientEvent::Output(chunk.text));
                }
                if chunk.requires_recovery && self.last_size.is_some() {
                    self.timers.recovery_redraw =
                        Some(Box::pin(sleep(self.config.recovery_redraw_delay)));
                }
            }
            Some(LinkEvent::Message(WireMessage::Error { message })) => {
                tracing::warn!(%message, "Gateway reported an error");
                self.emit(ClientEvent::ServerError(message));
            }
            Some(LinkEvent::Message(WireMessage::Heartbeat { .. })) => {
                tracing::trace!("Gateway heartbeat");
            }
            Some(LinkEvent::Message(other)) => {
                tracing::debug!(kind = other.message_type(), "Ignoring unexpected message");
            }
            Some(LinkEvent::Closed { code, reason }) => {
                tracing::info!(?code, %reason, "Gateway closed the connection");
                let reason = match code {
                    Some(code) if reason.is_empty() => format!("Connection closed ({})", code),
                    Some(code) => format!("Connection closed ({}): {}", code, reason),
                    None => "Connection lost".to_string(),
                };
                self.fail(reason);
            }
            Some(LinkEvent::Error(e)) => {
                tracing::warn!(error = %e, "Connection error");
                self.fail(e);
            }
            None => self.fail("Connection lost".to_string()),
        }
    }

    /// Moves to `Error` and schedules a reconnect, or gives up.
    fn fail(&mut self, reason: String) {
        self.drop_connection();
        self.set_state(ConnectionState::Error(reason));

        if !self.reconnect_enabled {
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempts();
                tracing::info!(attempt, "Reconnecting in {:?}", delay);
                self.timers.reconnect = Some(Box::pin(sleep(delay)));
                self.emit(ClientEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            None => {
                tracing::warn!(
                    attempts = self.backoff.attempts(),
                    "Giving up after repeated connection failures"
                );
                self.target = None;
                self.reconnect_enabled = false;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// User-initiated stop; safe to repeat.
    fn stop(&mut self) {
        self.reconnect_enabled = false;
        self.target = None;
        self.backoff.reset();
        self.drop_connection();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Cancels the attempt, closes the link and clears every timer.
    fn drop_connection(&mut self) {
        self.attempt = None;
        self.link = None;
        self.timers.cancel_all();
    }

    fn send_input(&mut self, data: String) {
        if self.link.is_none() {
            tracing::debug!("Dropping input while not connected");
            return;
        }

        let has_newline = data.contains(|c| c == '\n' || c == '\r');
        self.send(WireMessage::input(data));

        if has_newline && self.last_size.is_some() {
            self.timers.newline_resend = Some(Box::pin(sleep(self.config.newline_resend_delay)));
        }
    }

    fn flush_viewport(&mut self) {
        if let Some(size) = self.pending_size.take() {
            if self.last_size != Some(size) {
                self.apply_size(size);
            }
        }
    }

    fn apply_size(&mut self, size: TerminalSize) {
        self.last_size = Some(size);
        self.send(WireMessage::resize(size.cols, size.rows));
    }

    fn resend_size(&mut self) {
        if let Some(size) = self.last_size {
            self.send(WireMessage::resize(size.cols, size.rows));
        }
    }

    fn send(&mut self, msg: WireMessage) {
        let Some(link) = &self.link else {
            return;
        };
        let kind = msg.message_type();
        if let Err(e) = link.outgoing.try_send(msg) {
            tracing::warn!("failed to queue {} message: {}", kind, e);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        tracing::debug!(?state, "Connection state changed");
        self.state_tx.send_replace(state.clone());
        self.emit(ClientEvent::StateChanged(state));
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn settle(attempt: &mut Option<Attempt>) -> Result<Link, TransportError> {
    match attempt.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *attempt = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link.as_mut() {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(deadline) => {
            deadline.await;
            *timer = None;
        }
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::ConnectFuture;
    use crate::sanitizer::FORCE_AUTOWRAP;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    /// Gateway side of a fake link.
    struct ServerEnd {
        from_client: mpsc::Receiver<WireMessage>,
        to_client: mpsc::Sender<LinkEvent>,
    }

    struct FakeInner {
        accept: AtomicBool,
        attempts: Mutex<Vec<Instant>>,
        ends: mpsc::UnboundedSender<ServerEnd>,
    }

    #[derive(Clone)]
    struct FakeTransport(Arc<FakeInner>);

    impl FakeTransport {
        fn new(accept: bool) -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (ends, ends_rx) = mpsc::unbounded_channel();
            let inner = FakeInner {
                accept: AtomicBool::new(accept),
                attempts: Mutex::new(Vec::new()),
                ends,
            };
            (Self(Arc::new(inner)), ends_rx)
        }

        fn attempts(&self) -> Vec<Instant> {
            self.0.attempts.lock().unwrap().clone()
        }

        fn set_accept(&self, accept: bool) {
            self.0.accept.store(accept, Ordering::SeqCst);
        }
    }

    impl Transport for FakeTransport {
        fn connect<'a>(&'a self, _target: &'a ConnectionTarget) -> ConnectFuture<'a> {
            Box::pin(async move {
                self.0.attempts.lock().unwrap().push(Instant::now());
                if !self.0.accept.load(Ordering::SeqCst) {
                    return Err(TransportError::Connect("connection refused".into()));
                }

                let (outgoing, from_client) = mpsc::channel(64);
                let (to_client, incoming) = mpsc::channel(64);
                let _ = self.0.ends.send(ServerEnd {
                    from_client,
                    to_client,
                });
                Ok(Link { outgoing, incoming })
            })
        }
    }

    fn target() -> ConnectionTarget {
        ConnectionTarget::new("100.64.0.1", 8765, TOKEN)
    }

    async fn wait_for_state(
        events: &mut broadcast::Receiver<ClientEvent>,
        wanted: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        loop {
            if let ClientEvent::StateChanged(state) = events.recv().await.unwrap() {
                if wanted(&state) {
                    return state;
                }
            }
        }
    }

    async fn connected() -> (
        ConnectionManager,
        FakeTransport,
        ServerEnd,
        mpsc::UnboundedReceiver<ServerEnd>,
    ) {
        let (transport, mut ends) = FakeTransport::new(true);
        let manager = ConnectionManager::spawn(transport.clone(), ClientConfig::default());
        manager.connect(target()).await.unwrap();
        let server = ends.recv().await.unwrap();
        manager
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        (manager, transport, server, ends)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_target_makes_no_attempt() {
        let (transport, _ends) = FakeTransport::new(true);
        let manager = ConnectionManager::spawn(transport.clone(), ClientConfig::default());
        let mut events = manager.subscribe();

        let result = manager
            .connect(ConnectionTarget::new("100.64.0.1", 8765, " "))
            .await;
        assert_eq!(
            result,
            Err(ClientError::InvalidTarget(TargetError::EmptyToken))
        );

        let state = wait_for_state(&mut events, |_| true).await;
        assert!(matches!(state, ConnectionState::Error(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_disconnected() {
        let (transport, _ends) = FakeTransport::new(false);
        let manager = ConnectionManager::spawn(transport.clone(), ClientConfig::default());
        let mut events = manager.subscribe();

        manager.connect(target()).await.unwrap();

        let mut scheduled = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Reconnecting { attempt, delay_ms } => {
                    scheduled.push((attempt, delay_ms))
                }
                ClientEvent::StateChanged(ConnectionState::Disconnected) => break,
                _ => {}
            }
        }

        assert_eq!(
            scheduled,
            vec![(1, 2000), (2, 4000), (3, 6000), (4, 8000), (5, 10000)]
        );

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 6);
        let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, [2, 4, 6, 8, 10].map(Duration::from_secs).to_vec());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempts().len(), 6);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (transport, _ends) = FakeTransport::new(false);
        let manager = ConnectionManager::spawn(transport.clone(), ClientConfig::default());
        let mut events = manager.subscribe();

        manager.connect(target()).await.unwrap();
        wait_for_state(&mut events, |s| matches!(s, ConnectionState::Error(_))).await;

        manager.disconnect().await.unwrap();
        wait_for_state(&mut events, |s| *s == ConnectionState::Disconnected).await;
        manager.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_every_interval_while_connected() {
        let (manager, _transport, mut server, _ends) = connected().await;
        let start = Instant::now();

        for n in 1..=2u32 {
            let msg = server.from_client.recv().await.unwrap();
            assert!(matches!(msg, WireMessage::Heartbeat { ts: Some(_) }));
            assert_eq!(start.elapsed(), HEARTBEAT_INTERVAL * n);
        }

        manager.shutdown().await;
        assert!(server.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_and_sanitized_output() {
        let (manager, _transport, mut server, _ends) = connected().await;
        let mut events = manager.subscribe();

        manager.send_input("ls\n").await.unwrap();
        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::input("ls\n"))
        );

        server
            .to_client
            .send(LinkEvent::Message(WireMessage::output("a\x1b[?3hb")))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Output("ab".into()));

        server
            .to_client
            .send(LinkEvent::Message(WireMessage::error("Process exited with code 0")))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ServerError("Process exited with code 0".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resends_geometry() {
        let (manager, _transport, mut server, _ends) = connected().await;
        let mut events = manager.subscribe();

        manager.resize(TerminalSize::new(100, 30)).await.unwrap();
        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::resize(100, 30))
        );

        server
            .to_client
            .send(LinkEvent::Message(WireMessage::output("\x1b[?1049")))
            .await
            .unwrap();
        server
            .to_client
            .send(LinkEvent::Message(WireMessage::output("l$ ")))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Output(format!("\x1b[?1049l$ {}", FORCE_AUTOWRAP))
        );

        let before = Instant::now();
        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::resize(100, 30))
        );
        assert_eq!(before.elapsed(), DEFAULT_RECOVERY_REDRAW_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewport_changes_are_debounced() {
        let (manager, _transport, mut server, _ends) = connected().await;

        for width in [600.0, 700.0, 800.0] {
            manager
                .set_viewport(Viewport::new(width, 480.0, 8.0, 16.0))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let last_change = Instant::now() - Duration::from_millis(50);

        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::resize(100, 30))
        );
        assert_eq!(last_change.elapsed(), DEFAULT_RESIZE_DEBOUNCE);

        // Same geometry again is not re-sent.
        manager
            .set_viewport(Viewport::new(805.0, 490.0, 8.0, 16.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newline_input_resends_geometry_once() {
        let (manager, _transport, mut server, _ends) = connected().await;

        manager.resize(TerminalSize::new(120, 40)).await.unwrap();
        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::resize(120, 40))
        );

        manager.send_input("top").await.unwrap();
        manager.send_input("\r").await.unwrap();
        assert_eq!(server.from_client.recv().await, Some(WireMessage::input("top")));
        assert_eq!(server.from_client.recv().await, Some(WireMessage::input("\r")));

        let before = Instant::now();
        assert_eq!(
            server.from_client.recv().await,
            Some(WireMessage::resize(120, 40))
        );
        assert_eq!(before.elapsed(), DEFAULT_NEWLINE_RESEND_DELAY);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_reconnects_and_resets_budget() {
        let (manager, transport, server, mut ends) = connected().await;
        let mut events = manager.subscribe();
        let mut state = manager.watch_state();

        server
            .to_client
            .send(LinkEvent::Closed {
                code: Some(1001),
                reason: "Heartbeat timeout".into(),
            })
            .await
            .unwrap();

        let err = wait_for_state(&mut events, |s| matches!(s, ConnectionState::Error(_))).await;
        assert_eq!(
            err,
            ConnectionState::Error("Connection closed (1001): Heartbeat timeout".into())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Reconnecting {
                attempt: 1,
                delay_ms: 2000
            }
        );

        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(transport.attempts().len(), 2);
        drop(server);

        // A fresh failure after a successful open starts again at 2s.
        let second = ends.recv().await.unwrap();
        transport.set_accept(false);
        let mut events = manager.subscribe();
        drop(second);
        let lost = wait_for_state(&mut events, |s| matches!(s, ConnectionState::Error(_))).await;
        assert_eq!(lost, ConnectionState::Error("Connection lost".into()));
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Reconnecting {
                attempt: 1,
                delay_ms: 2000
            }
        );
    }

    #[test]
    fn test_viewport_cells() {
        assert_eq!(
            Viewport::new(800.0, 480.0, 8.0, 16.0).cells(),
            Some(TerminalSize::new(100, 30))
        );
        assert_eq!(
            Viewport::new(805.9, 495.0, 8.0, 16.0).cells(),
            Some(TerminalSize::new(100, 30))
        );
        assert_eq!(Viewport::new(800.0, 480.0, 0.0, 16.0).cells(), None);
        assert_eq!(Viewport::new(4.0, 480.0, 8.0, 16.0).cells(), None);
    }

    #[test]
    fn test_state_serializes_with_reason() {
        let json = serde_json::to_string(&ConnectionState::Error("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"Error","reason":"boom"}"#);
    }
}

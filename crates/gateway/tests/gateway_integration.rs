//! End-to-end tests for the gateway over real TCP connections.
//!
//! These tests verify complete flows:
//! - Upgrade authentication (HTTP 401)
//! - Single-session admission (close 1008)
//! - Shell I/O through a real PTY
//! - Spawn failure, liveness timeout and shutdown closes

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway::auth::{SecretStore, TokenFileStore, TokenProvider};
use gateway::config::Config;
use gateway::server::{Gateway, GatewayEvent};
use gateway::session::{
    PtyError, PtyEvent, PtySupervisor, ShellHandle, ShellSpawner, SpawnOptions, SpawnedShell,
};
use protocol::close;
use protocol::{TerminalSize, WireMessage};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "3f9c2a7b1e8d4c6a0b5f7e2d9c1a8b3e6f4d2c0a9b8e7f6d5c4b3a2918171615";

/// Shell that produces no output and lives until killed.
struct IdleShell {
    kills: Arc<AtomicUsize>,
    _events: mpsc::Sender<PtyEvent>,
}

impl ShellHandle for IdleShell {
    fn write(&mut self, _data: &[u8]) -> Result<(), PtyError> {
        Ok(())
    }

    fn resize(&mut self, _size: TerminalSize) -> Result<bool, PtyError> {
        Ok(true)
    }

    fn kill(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn size(&self) -> TerminalSize {
        TerminalSize::default()
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Spawner that counts spawns and hands out idle shells, or fails.
#[derive(Default)]
struct CountingSpawner {
    spawns: AtomicUsize,
    kills: Arc<AtomicUsize>,
    fail: bool,
    keep: Mutex<Vec<mpsc::Sender<PtyEvent>>>,
}

impl ShellSpawner for CountingSpawner {
    fn spawn(&self, _size: TerminalSize) -> Result<SpawnedShell, PtyError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PtyError::SpawnFailed("no pty devices left".to_string()));
        }

        let (tx, events) = mpsc::channel(8);
        self.keep.lock().unwrap().push(tx.clone());
        Ok(SpawnedShell {
            handle: Box::new(IdleShell {
                kills: Arc::clone(&self.kills),
                _events: tx,
            }),
            events,
        })
    }
}

struct TestGateway {
    gateway: Gateway,
    addr: SocketAddr,
    events: broadcast::Receiver<GatewayEvent>,
    _dir: TempDir,
}

async fn start_gateway(spawner: Arc<dyn ShellSpawner>) -> TestGateway {
    start_gateway_with(spawner, |g| g).await
}

async fn start_gateway_with(
    spawner: Arc<dyn ShellSpawner>,
    configure: impl FnOnce(Gateway) -> Gateway,
) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let store = TokenFileStore::new(dir.path().join("token"));
    store.set(TOKEN).unwrap();

    let auth = TokenProvider::new(store);
    auth.init().unwrap();

    let gateway = configure(Gateway::new(Config::default(), auth, spawner));
    let events = gateway.subscribe();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = gateway.clone();
    tokio::spawn(async move { server.serve(listener).await });

    TestGateway {
        gateway,
        addr,
        events,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr, auth_header: Option<&str>) -> Result<Client, WsError> {
    let mut request = format!("ws://{}/terminal", addr)
        .into_client_request()
        .unwrap();
    if let Some(value) = auth_header {
        request
            .headers_mut()
            .insert(AUTHORIZATION, value.parse().unwrap());
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
}

async fn connect_ok(addr: SocketAddr) -> Client {
    connect(addr, Some(&format!("Bearer {}", TOKEN))).await.unwrap()
}

async fn wait_for(
    events: &mut broadcast::Receiver<GatewayEvent>,
    pred: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for gateway event")
}

/// Reads frames until a close frame arrives, returning its code and reason.
async fn read_until_close(client: &mut Client) -> (Vec<WireMessage>, Option<(u16, String)>) {
    let mut messages = Vec::new();
    let result = timeout(Duration::from_secs(5), async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Text(text)) => messages.push(WireMessage::decode(&text).unwrap()),
                Ok(Message::Close(frame)) => {
                    return frame.map(|f| (u16::from(f.code), f.reason.into_owned()))
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .expect("timed out waiting for close");
    (messages, result)
}

fn unauthorized(result: Result<Client, WsError>) -> bool {
    matches!(result, Err(WsError::Http(response)) if response.status() == 401)
}

#[tokio::test]
async fn test_missing_token_is_rejected_with_401() {
    let spawner = Arc::new(CountingSpawner::default());
    let mut t = start_gateway(spawner.clone()).await;

    assert!(unauthorized(connect(t.addr, None).await));

    let event = wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::AuthRejected { .. })
    })
    .await;
    assert!(matches!(
        event,
        GatewayEvent::AuthRejected {
            error: gateway::AuthError::MissingHeader,
            ..
        }
    ));
    assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bad_tokens_are_rejected_with_401() {
    let spawner = Arc::new(CountingSpawner::default());
    let t = start_gateway(spawner.clone()).await;

    assert!(unauthorized(connect(t.addr, Some("Bearer wrong")).await));
    assert!(unauthorized(connect(t.addr, Some("Basic x:y")).await));
    assert!(unauthorized(
        connect(t.addr, Some(&format!("Bearer {}0", TOKEN))).await
    ));
    assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
    assert_eq!(t.gateway.admission().active(), 0);
}

#[tokio::test]
async fn test_second_connection_is_closed_with_1008() {
    let spawner = Arc::new(CountingSpawner::default());
    let mut t = start_gateway(spawner.clone()).await;

    let _first = connect_ok(t.addr).await;
    wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::SessionStarted { .. })
    })
    .await;

    let mut second = connect_ok(t.addr).await;
    let (_, close_frame) = read_until_close(&mut second).await;
    assert_eq!(
        close_frame,
        Some((close::POLICY_VIOLATION, close::REASON_CAPACITY.to_string()))
    );
    assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slot_is_released_after_session_ends() {
    let spawner = Arc::new(CountingSpawner::default());
    let mut t = start_gateway(spawner.clone()).await;

    let mut first = connect_ok(t.addr).await;
    wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::SessionStarted { .. })
    })
    .await;
    first.close(None).await.unwrap();
    wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::SessionEnded { .. })
    })
    .await;

    assert_eq!(spawner.kills.load(Ordering::SeqCst), 1);

    let _second = connect_ok(t.addr).await;
    wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::SessionStarted { .. })
    })
    .await;
    assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spawn_failure_reports_and_closes() {
    let spawner = Arc::new(CountingSpawner {
        fail: true,
        ..Default::default()
    });
    let t = start_gateway(spawner).await;

    let mut client = connect_ok(t.addr).await;
    let (messages, close_frame) = read_until_close(&mut client).await;

    assert_eq!(
        messages,
        vec![WireMessage::error(close::REASON_SPAWN_FAILED)]
    );
    assert_eq!(
        close_frame,
        Some((close::INTERNAL_ERROR, close::REASON_SPAWN_FAILED.to_string()))
    );
    assert_eq!(t.gateway.admission().active(), 0);
}

#[tokio::test]
async fn test_silent_client_is_closed_after_timeout() {
    let spawner = Arc::new(CountingSpawner::default());
    let t = start_gateway_with(spawner.clone(), |g| {
        g.with_heartbeat(Duration::from_millis(50), Duration::from_millis(300))
    })
    .await;

    let mut client = connect_ok(t.addr).await;
    let (messages, close_frame) = read_until_close(&mut client).await;

    assert!(messages
        .iter()
        .any(|m| matches!(m, WireMessage::Heartbeat { ts: Some(_) })));
    assert_eq!(
        close_frame,
        Some((
            close::GOING_AWAY,
            close::REASON_HEARTBEAT_TIMEOUT.to_string()
        ))
    );
    assert_eq!(spawner.kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_drains() {
    let spawner = Arc::new(CountingSpawner::default());
    let mut t = start_gateway(spawner.clone()).await;

    let mut client = connect_ok(t.addr).await;
    wait_for(&mut t.events, |e| {
        matches!(e, GatewayEvent::SessionStarted { .. })
    })
    .await;

    let gateway = t.gateway.clone();
    let drain = tokio::spawn(async move { gateway.shutdown(Duration::from_secs(5)).await });

    let (_, close_frame) = read_until_close(&mut client).await;
    assert_eq!(
        close_frame,
        Some((close::GOING_AWAY, close::REASON_SERVER_SHUTDOWN.to_string()))
    );

    assert!(drain.await.unwrap().is_ok());
    assert_eq!(spawner.kills.load(Ordering::SeqCst), 1);

    wait_for(&mut t.events, |e| matches!(e, GatewayEvent::Stopped)).await;
    assert!(connect(t.addr, Some(&format!("Bearer {}", TOKEN)))
        .await
        .is_err());
}

#[tokio::test]
async fn test_real_shell_round_trip() {
    let spawner = Arc::new(PtySupervisor::new(SpawnOptions::new("/bin/sh")));
    let t = start_gateway(spawner).await;

    let mut client = connect_ok(t.addr).await;
    let input = WireMessage::input("echo gateway_$((20+22))\n").to_json().unwrap();
    client.send(Message::Text(input)).await.unwrap();

    let mut output = String::new();
    let found = timeout(Duration::from_secs(10), async {
        while let Some(Ok(frame)) = client.next().await {
            if let Message::Text(text) = frame {
                if let Ok(WireMessage::Output { data }) = WireMessage::decode(&text) {
                    output.push_str(&data);
                    if output.contains("gateway_42") {
                        return true;
                    }
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "shell output never arrived: {:?}", output);

    let exit = WireMessage::input("exit 3\n").to_json().unwrap();
    client.send(Message::Text(exit)).await.unwrap();

    let (messages, close_frame) = read_until_close(&mut client).await;
    assert!(messages.contains(&WireMessage::error("Process exited with code 3")));
    assert_eq!(
        close_frame,
        Some((close::NORMAL, close::REASON_PROCESS_EXITED.to_string()))
    );
}

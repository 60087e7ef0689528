//! Connection lifecycle: transport, state machine and timers.

pub mod manager;
pub mod transport;

pub use manager::{
    ClientConfig, ClientError, ClientEvent, ConnectionManager, ConnectionState, Viewport,
};
pub use transport::{Link, LinkEvent, Transport, TransportError, WebSocketTransport};

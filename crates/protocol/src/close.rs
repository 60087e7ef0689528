//! Close codes and reasons used when a connection ends.
//!
//! 1001 covers both the liveness timeout and server shutdown; the two are
//! told apart only by the reason string.

/// Normal closure.
pub const NORMAL: u16 = 1000;

/// Endpoint going away: heartbeat timeout or server shutdown.
pub const GOING_AWAY: u16 = 1001;

/// Connection lost without a close frame. Never sent on the wire.
pub const ABNORMAL: u16 = 1006;

/// Policy violation: the session capacity is exhausted.
pub const POLICY_VIOLATION: u16 = 1008;

/// The gateway could not set up the terminal session.
pub const INTERNAL_ERROR: u16 = 1011;

pub const REASON_HEARTBEAT_TIMEOUT: &str = "Heartbeat timeout";
pub const REASON_SERVER_SHUTDOWN: &str = "Server shutdown";
pub const REASON_CAPACITY: &str = "Maximum connections reached";
pub const REASON_PROCESS_EXITED: &str = "Process exited";
pub const REASON_SPAWN_FAILED: &str = "Failed to create terminal session";

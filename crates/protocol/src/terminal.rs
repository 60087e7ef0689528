//! Terminal geometry shared by the gateway and the client.

use serde::{Deserialize, Serialize};

/// Narrowest geometry the gateway will apply to a PTY.
pub const MIN_COLS: u16 = 30;

/// Shortest geometry the gateway will apply to a PTY.
pub const MIN_ROWS: u16 = 10;

/// Columns used when a shell is spawned without an explicit size.
pub const DEFAULT_COLS: u16 = 80;

/// Rows used when a shell is spawned without an explicit size.
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Whether this size meets the `MIN_COLS` x `MIN_ROWS` floor. Sizes below
    /// the floor are ignored by the gateway, never rejected.
    pub fn meets_floor(&self) -> bool {
        self.cols >= MIN_COLS && self.rows >= MIN_ROWS
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_80_by_24() {
        assert_eq!(TerminalSize::default(), TerminalSize::new(80, 24));
    }

    #[test]
    fn test_floor() {
        assert!(!TerminalSize::new(20, 5).meets_floor());
        assert!(!TerminalSize::new(29, 40).meets_floor());
        assert!(!TerminalSize::new(200, 9).meets_floor());
        assert!(TerminalSize::new(30, 10).meets_floor());
        assert!(TerminalSize::new(100, 30).meets_floor());
    }
}

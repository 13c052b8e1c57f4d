//! Long-lived echo sessions.
//!
//! A session is one upgraded WebSocket connection or one SSE stream. Both
//! kinds enforce the same sliding-window idle timeout:
//!
//! - `websocket`: the deadline bounds each read; a received data frame
//!   re-arms it.
//! - `sse`: the deadline is a timer raced against the heartbeat and client
//!   cancellation; each heartbeat re-arms it.
//!
//! Sessions own all of their state and share nothing with each other.

pub mod sse;
pub mod websocket;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Longest window a deadline can be armed with. Longer windows are capped
/// so that `now + window` stays representable.
pub const MAX_WINDOW: Duration = Duration::from_secs(86400 * 365 * 30);

/// Point in time at which an idle session expires.
///
/// Re-arming replaces the deadline with `now + window`; it never adds to
/// the remaining time.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    window: Duration,
}

impl Deadline {
    /// Arm a deadline `window` from now.
    pub fn arm(window: Duration) -> Self {
        let window = window.min(MAX_WINDOW);
        Self {
            at: Instant::now() + window,
            window,
        }
    }

    /// Push the deadline to `window` from now.
    pub fn rearm(&mut self) {
        self.at = Instant::now() + self.window;
    }

    /// The current expiry instant.
    pub fn at(&self) -> Instant {
        self.at
    }
}

/// How a session ended. Exactly one applies to each session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The idle timeout expired and the client was notified.
    TimedOut,
    /// The client closed a WebSocket connection.
    ClientClosed,
    /// The SSE client went away.
    Cancelled,
    /// Reading or writing failed.
    Transport(String),
}

/// Remote address of a session, for log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peer(pub Option<SocketAddr>);

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("-"),
        }
    }
}

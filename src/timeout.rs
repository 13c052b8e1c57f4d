//! Connection timeout policy for long-lived sessions.
//!
//! WebSocket and SSE sessions share one idle timeout, resolved from the
//! environment when the session starts:
//!
//! | Key | Order |
//! |-----|-------|
//! | `CONNECTION_TIMEOUT_MINUTES` | consulted first |
//! | `WEBSOCKET_TIMEOUT_MINUTES` | legacy alias, consulted second |
//!
//! Values are fractional minutes. A key counts as set only if its value
//! parses to a positive, finite number; anything else is ignored and the
//! next key is tried. With no usable key the default of 10 minutes applies.

use std::fmt;
use std::time::Duration;

use crate::env::EnvSource;

/// Default timeout when no key is usable.
pub const DEFAULT_TIMEOUT_MINUTES: f64 = 10.0;

/// Timeout keys, first match wins.
pub const TIMEOUT_KEYS: [&str; 2] = ["CONNECTION_TIMEOUT_MINUTES", "WEBSOCKET_TIMEOUT_MINUTES"];

/// Resolved idle timeout for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionTimeout {
    minutes: f64,
    duration: Duration,
}

impl ConnectionTimeout {
    /// Build a timeout from fractional minutes.
    ///
    /// Returns `None` unless `minutes` is finite, positive and representable
    /// as a non-zero [`Duration`].
    pub fn from_minutes(minutes: f64) -> Option<Self> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return None;
        }
        let duration = Duration::try_from_secs_f64(minutes * 60.0).ok()?;
        if duration.is_zero() {
            return None;
        }
        Some(Self { minutes, duration })
    }

    /// Resolve the timeout from environment settings.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        TIMEOUT_KEYS
            .iter()
            .find_map(|key| env.var(key).as_deref().and_then(parse_minutes))
            .unwrap_or_default()
    }

    /// Configured value in minutes, as used in client-facing messages.
    pub fn minutes(&self) -> f64 {
        self.minutes
    }

    /// Idle period after which the session is closed.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Text delivered to the client when the session times out.
    pub fn message(&self) -> String {
        let n = self;
        format!(
            "Connection timeout: This connection has been closed after {n} minutes. \
             This server is designed for testing with use no longer than {n} minutes."
        )
    }
}

impl Default for ConnectionTimeout {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_TIMEOUT_MINUTES,
            duration: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES as u64 * 60),
        }
    }
}

/// Renders the minute count: `10`, `0.05`, `1.5`.
impl fmt::Display for ConnectionTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes)
    }
}

fn parse_minutes(raw: &str) -> Option<ConnectionTimeout> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(ConnectionTimeout::from_minutes)
}

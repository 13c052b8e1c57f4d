//! Server hostname announcements.
//!
//! The WebSocket and plain HTTP paths always say something when an
//! announcement is enabled, falling back to an error message if the
//! hostname can't be resolved. The SSE path only announces a resolved
//! hostname and stays silent otherwise.

use std::io;

/// Resolves the name of the host serving a request.
pub type HostnameLookup = fn() -> io::Result<String>;

/// Hostname of this machine.
pub fn system_hostname() -> io::Result<String> {
    hostname::get().map(|name| name.to_string_lossy().into_owned())
}

/// Announcement text for WebSocket frames and plain HTTP bodies.
pub fn served_by(lookup: HostnameLookup) -> String {
    match lookup() {
        Ok(host) => format!("Request served by {host}"),
        Err(e) => format!("Server hostname unknown: {e}"),
    }
}

/// Bare hostname for the SSE `server` event, if it resolves.
pub fn event_hostname(lookup: HostnameLookup) -> Option<String> {
    lookup().ok()
}

#[cfg(test)]
pub(crate) fn fixed_hostname() -> io::Result<String> {
    Ok("echo-test-host".to_string())
}

#[cfg(test)]
pub(crate) fn failing_hostname() -> io::Result<String> {
    Err(io::Error::new(io::ErrorKind::NotFound, "no hostname"))
}

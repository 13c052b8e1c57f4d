//! WebSocket echo session.
//!
//! One task drives the connection: it reads a frame with the idle deadline
//! as the read's time limit, then writes the echo. Nothing else writes to
//! the socket, so the deadline firing and a frame arriving can't race; one
//! read call sees exactly one of them.
//!
//! On expiry the client first receives the timeout message as a text frame
//! and then a close frame carrying as much of the message as fits in a
//! close reason.

use std::future::Future;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use tokio::time;
use tracing::{debug, info, trace};

use super::{Deadline, Peer, SessionEnd};
use crate::timeout::ConnectionTimeout;

/// Largest close reason a close frame can carry (125-byte control payload
/// minus the 2-byte status code).
pub const MAX_CLOSE_REASON: usize = 123;

/// Time allowed for delivering the timeout notice.
const NOTICE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for the close handshake once the client sent Close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Message transport a session runs over.
pub trait MessageSocket {
    /// Next message, `None` once the connection is gone.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Message, axum::Error>>> + Send;

    /// Write one message and flush it.
    fn send(&mut self, message: Message) -> impl Future<Output = Result<(), axum::Error>> + Send;
}

impl MessageSocket for WebSocket {
    fn recv(&mut self) -> impl Future<Output = Option<Result<Message, axum::Error>>> + Send {
        WebSocket::recv(self)
    }

    fn send(&mut self, message: Message) -> impl Future<Output = Result<(), axum::Error>> + Send {
        WebSocket::send(self, message)
    }
}

/// Lifecycle of a WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Upgraded; no client frame seen yet.
    AwaitingFirstRead,
    /// At least one frame echoed.
    Active,
    /// A close is in progress, from either side.
    Closing,
    /// Finished.
    Closed,
}

/// Per-connection WebSocket echo state.
pub struct WebSocketSession {
    peer: Peer,
    timeout: ConnectionTimeout,
    announcement: Option<String>,
    phase: Phase,
}

impl WebSocketSession {
    /// Create a session. `announcement`, when present, is sent as the first
    /// frame.
    pub fn new(peer: Peer, timeout: ConnectionTimeout, announcement: Option<String>) -> Self {
        Self {
            peer,
            timeout,
            announcement,
            phase: Phase::AwaitingFirstRead,
        }
    }

    /// Echo frames until the client leaves, the transport fails, or the
    /// connection is idle for the configured timeout.
    pub async fn run<S: MessageSocket>(mut self, mut socket: S) -> SessionEnd {
        info!(peer = %self.peer, "Upgraded to websocket");

        if let Some(text) = self.announcement.take() {
            if let Err(e) = socket.send(Message::Text(text.into())).await {
                return self.finish(SessionEnd::Transport(e.to_string()));
            }
        }

        let mut deadline = Deadline::arm(self.timeout.duration());

        loop {
            let message = match time::timeout_at(deadline.at(), socket.recv()).await {
                Err(_elapsed) => {
                    self.enter(Phase::Closing);
                    self.send_timeout_notice(&mut socket).await;
                    info!(
                        peer = %self.peer,
                        minutes = self.timeout.minutes(),
                        "WebSocket connection timed out"
                    );
                    return self.finish(SessionEnd::TimedOut);
                }
                Ok(None) => return self.finish(SessionEnd::ClientClosed),
                Ok(Some(Err(e))) => return self.finish(SessionEnd::Transport(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            let reply = match message {
                Message::Text(text) => {
                    debug!(peer = %self.peer, "txt | {}", text.as_str());
                    Message::Text(text)
                }
                Message::Binary(data) => {
                    debug!(peer = %self.peer, "bin | {} byte(s)", data.len());
                    Message::Binary(data)
                }
                Message::Close(frame) => {
                    trace!(peer = %self.peer, ?frame, "Client requested close");
                    self.enter(Phase::Closing);
                    self.complete_close(&mut socket).await;
                    return self.finish(SessionEnd::ClientClosed);
                }
                // Answered by the protocol layer; not client data.
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            deadline.rearm();
            self.enter(Phase::Active);

            if let Err(e) = socket.send(reply).await {
                return self.finish(SessionEnd::Transport(e.to_string()));
            }
        }
    }

    /// The close reply is queued by the protocol layer and flushed by the
    /// next read, which then reports the end of the stream.
    async fn complete_close<S: MessageSocket>(&self, socket: &mut S) {
        let drain = async { while let Some(Ok(_)) = socket.recv().await {} };
        if time::timeout(CLOSE_GRACE, drain).await.is_err() {
            debug!(peer = %self.peer, "Close handshake did not complete");
        }
    }

    async fn send_timeout_notice<S: MessageSocket>(&self, socket: &mut S) {
        let message = self.timeout.message();
        let close = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: close_reason(&message).to_string().into(),
        }));

        let notice = async {
            socket.send(Message::Text(message.into())).await?;
            socket.send(close).await
        };
        match time::timeout(NOTICE_WRITE_TIMEOUT, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "Failed to send timeout notice"),
            Err(_) => debug!(peer = %self.peer, "Timed out sending timeout notice"),
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(peer = %self.peer, from = ?self.phase, to = ?phase, "WebSocket phase");
            self.phase = phase;
        }
    }

    fn finish(&mut self, end: SessionEnd) -> SessionEnd {
        self.enter(Phase::Closed);
        match &end {
            SessionEnd::Transport(e) => debug!(peer = %self.peer, error = %e, "WebSocket error"),
            other => debug!(peer = %self.peer, end = ?other, "WebSocket closed"),
        }
        end
    }
}

/// Longest prefix of `message` that fits in a close frame, cut on a
/// character boundary.
pub fn close_reason(message: &str) -> &str {
    if message.len() <= MAX_CLOSE_REASON {
        return message;
    }
    let mut end = MAX_CLOSE_REASON;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted client messages and records what the session sends.
    /// Once the script runs out, reads either hang (an idle client) or
    /// report the end of the stream.
    struct ScriptedSocket {
        incoming: VecDeque<Result<Message, axum::Error>>,
        hang_when_empty: bool,
        sent: Vec<Message>,
    }

    impl ScriptedSocket {
        fn new<const N: usize>(incoming: [Message; N], hang_when_empty: bool) -> Self {
            Self {
                incoming: incoming.into_iter().map(Ok).collect(),
                hang_when_empty,
                sent: Vec::new(),
            }
        }
    }

    impl MessageSocket for &mut ScriptedSocket {
        fn recv(&mut self) -> impl Future<Output = Option<Result<Message, axum::Error>>> + Send {
            let next = self.incoming.pop_front();
            let hang = self.hang_when_empty;
            async move {
                match next {
                    Some(message) => Some(message),
                    None if hang => std::future::pending().await,
                    None => None,
                }
            }
        }

        fn send(&mut self, message: Message) -> impl Future<Output = Result<(), axum::Error>> + Send {
            self.sent.push(message);
            std::future::ready(Ok(()))
        }
    }

    fn session(minutes: f64) -> WebSocketSession {
        WebSocketSession::new(
            Peer::default(),
            ConnectionTimeout::from_minutes(minutes).unwrap(),
            Some("Request served by echo-test-host".to_string()),
        )
    }

    fn text(s: &str) -> Message {
        Message::Text(s.into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_close_ends_without_notice() {
        // The 300ms timeout is shorter than the close handshake grace, and
        // the peer never reports the end of the stream.
        let mut socket = ScriptedSocket::new([text("hi"), Message::Close(None)], true);
        let end = session(0.005).run(&mut socket).await;

        assert_eq!(end, SessionEnd::ClientClosed);
        assert_eq!(socket.sent, [text("Request served by echo-test-host"), text("hi")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_client_close() {
        let mut socket = ScriptedSocket::new([Message::Binary(vec![1, 2, 3].into())], false);
        let end = session(0.005).run(&mut socket).await;

        assert_eq!(end, SessionEnd::ClientClosed);
        assert_eq!(socket.sent[1], Message::Binary(vec![1, 2, 3].into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_sends_notice_then_close() {
        let mut socket = ScriptedSocket::new([], true);
        let start = time::Instant::now();
        let end = session(0.005).run(&mut socket).await;

        assert_eq!(end, SessionEnd::TimedOut);
        assert!(time::Instant::now() - start >= Duration::from_millis(300));

        let message = ConnectionTimeout::from_minutes(0.005).unwrap().message();
        assert_eq!(socket.sent.len(), 3);
        assert_eq!(socket.sent[1], text(&message));
        match &socket.sent[2] {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::NORMAL);
                assert_eq!(frame.reason.as_str(), close_reason(&message));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_not_echoed() {
        let mut socket = ScriptedSocket::new([Message::Ping(vec![9].into())], false);
        let end = session(0.005).run(&mut socket).await;

        assert_eq!(end, SessionEnd::ClientClosed);
        assert_eq!(socket.sent, [text("Request served by echo-test-host")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_is_transport_end() {
        let mut socket = ScriptedSocket::new([text("a")], false);
        socket
            .incoming
            .push_back(Err(axum::Error::new(std::io::Error::other("reset"))));
        let end = session(0.005).run(&mut socket).await;

        assert!(matches!(end, SessionEnd::Transport(e) if e.contains("reset")));
    }

    #[test]
    fn test_close_reason_fits_control_frame() {
        let message = ConnectionTimeout::from_minutes(0.05).unwrap().message();
        assert!(message.len() > MAX_CLOSE_REASON);

        let reason = close_reason(&message);
        assert_eq!(reason.len(), MAX_CLOSE_REASON);
        assert!(reason.starts_with(
            "Connection timeout: This connection has been closed after 0.05 minutes."
        ));
    }

    #[test]
    fn test_close_reason_short_message_unchanged() {
        assert_eq!(close_reason("Connection timeout"), "Connection timeout");
    }

    #[test]
    fn test_close_reason_respects_char_boundary() {
        let message = format!("{}é", "a".repeat(MAX_CLOSE_REASON - 1));
        let reason = close_reason(&message);
        assert_eq!(reason.len(), MAX_CLOSE_REASON - 1);
        assert!(reason.chars().all(|c| c == 'a'));
    }
}

//! Server-Sent Events echo session.
//!
//! After a fixed preamble (`server`, if announced, then `request`) the
//! session emits a `time` heartbeat every second. Each iteration races
//! three things and acts on whichever happens first:
//!
//! 1. the client going away (the response body was dropped),
//! 2. the idle deadline expiring, which emits a final `error` event,
//! 3. the heartbeat tick, which emits `time` and re-arms the deadline.
//!
//! Events travel to the response body over a channel of capacity one, so
//! at most one event is ever in flight and each arrives at the transport as
//! its own chunk.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Local, SecondsFormat};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{Deadline, Peer, SessionEnd};
use crate::timeout::ConnectionTimeout;

/// Cadence of `time` events.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of an SSE session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Preamble not yet sent.
    Started,
    /// Emitting heartbeats.
    Streaming,
    /// Deadline expired; the `error` event is being delivered.
    TimedOut,
    /// The client disconnected.
    Cancelled,
    /// Finished.
    Closed,
}

/// Receiver side of an event stream; becomes the response body.
pub type EventReceiver = mpsc::Receiver<Bytes>;

/// The client is no longer reading the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Writes numbered events to one SSE stream.
pub struct EventWriter {
    tx: mpsc::Sender<Bytes>,
    peer: Peer,
    last_id: u64,
}

impl EventWriter {
    /// Create a writer and the receiver that feeds the response body.
    pub fn channel(peer: Peer) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                tx,
                peer,
                last_id: 0,
            },
            rx,
        )
    }

    /// Send one event. Ids start at 1 and increase by one per event,
    /// whatever its type.
    pub async fn send(&mut self, event: &str, data: &str) -> Result<(), Disconnected> {
        self.last_id += 1;
        let id = self.last_id;

        for line in data.split('\n') {
            debug!(peer = %self.peer, "sse | data: {line}");
        }
        trace!(peer = %self.peer, event, id, "sse event");

        self.tx
            .send(encode(event, data, id))
            .await
            .map_err(|_| Disconnected)
    }

    /// Resolves once the client has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Serialize one event in the `text/event-stream` wire format. Multi-line
/// data is split across several `data:` fields.
pub fn encode(event: &str, data: &str, id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(event.len() + data.len() + 32);
    put_field(&mut buf, "event", event);
    put_field(&mut buf, "data", data);
    put_field(&mut buf, "id", &id.to_string());
    buf.put_u8(b'\n');
    buf.freeze()
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    for line in value.split('\n') {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
}

/// Per-stream SSE state.
pub struct SseSession {
    writer: EventWriter,
    timeout: ConnectionTimeout,
    heartbeat: Duration,
    phase: Phase,
}

impl SseSession {
    /// Create a session that writes through `writer`.
    pub fn new(writer: EventWriter, timeout: ConnectionTimeout) -> Self {
        Self {
            writer,
            timeout,
            heartbeat: HEARTBEAT_INTERVAL,
            phase: Phase::Started,
        }
    }

    /// Emit the preamble, then heartbeats until the client leaves or the
    /// deadline passes.
    ///
    /// `hostname` becomes the `server` event when present; `request` is the
    /// echoed request and is always sent.
    pub async fn run(mut self, hostname: Option<String>, request: String) -> SessionEnd {
        if let Some(host) = hostname {
            if self.writer.send("server", &host).await.is_err() {
                return self.finish(Phase::Cancelled, SessionEnd::Cancelled);
            }
        }
        if self.writer.send("request", &request).await.is_err() {
            return self.finish(Phase::Cancelled, SessionEnd::Cancelled);
        }

        self.enter(Phase::Streaming);
        let mut ticker = time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Deadline::arm(self.timeout.duration());

        loop {
            tokio::select! {
                biased;

                _ = self.writer.closed() => {
                    return self.finish(Phase::Cancelled, SessionEnd::Cancelled);
                }
                _ = time::sleep_until(deadline.at()) => {
                    self.enter(Phase::TimedOut);
                    // The client may already be gone; the session ends either way.
                    let _ = self.writer.send("error", &self.timeout.message()).await;
                    info!(
                        peer = %self.writer.peer,
                        minutes = self.timeout.minutes(),
                        "SSE connection timed out"
                    );
                    return self.finish(Phase::Closed, SessionEnd::TimedOut);
                }
                _ = ticker.tick() => {
                    let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                    if self.writer.send("time", &now).await.is_err() {
                        return self.finish(Phase::Cancelled, SessionEnd::Cancelled);
                    }
                    deadline.rearm();
                }
            }
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(peer = %self.writer.peer, from = ?self.phase, to = ?phase, "SSE phase");
            self.phase = phase;
        }
    }

    fn finish(&mut self, phase: Phase, end: SessionEnd) -> SessionEnd {
        self.enter(phase);
        self.enter(Phase::Closed);
        debug!(peer = %self.writer.peer, end = ?end, "SSE stream closed");
        end
    }
}

//! Per-client WebSocket session.
//!
//! Each upgraded socket gets its own `Connection` that:
//! - Registers with the hub under the client's username
//! - Runs a write task draining the outbound queue and sending pings
//! - Reads and decodes inbound frames, routing them to the hub
//! - Deregisters when the socket fails, times out, closes or is replaced
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors end this session only
//! - Undecodable frames are logged and skipped

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callhub_core::{ConnectionId, Username};
use callhub_protocol::{decode_client, encode_server, ServerMessage, DEFAULT_MAX_MESSAGE_BYTES};

use crate::hub::{HubError, HubHandle};

/// Close code sent to a connection replaced by a newer one for the same user
pub const CLOSE_REPLACED: u16 = 4000;

/// Close code sent when the hub refuses a registration
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// Write timeout for a single frame (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Settings
// ============================================================================

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of the outbound queue
    pub outbound_queue: usize,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// A connection with no inbound frame for this long is dropped
    pub idle_timeout: Duration,
    /// Largest inbound text frame accepted
    pub max_message_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

// ============================================================================
// Connection Handle (hub side)
// ============================================================================

/// What the hub stores for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: Username,
    sender: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh connection ID.
    pub fn new(user: Username, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::next(),
            user,
            sender,
            evicted: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &Username {
        &self.user
    }

    /// Enqueues a message without waiting for queue space.
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        self.sender.try_send(msg)
    }

    /// Tells the session it has been replaced and must close.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

// ============================================================================
// Connection (socket side)
// ============================================================================

/// Cancellation signals shared by the read and write halves.
#[derive(Clone)]
struct Signals {
    /// Fired by the hub when a newer connection takes over the username
    evicted: CancellationToken,
    /// Ends this session; child of `shutdown`
    closer: CancellationToken,
    /// Server-wide shutdown
    shutdown: CancellationToken,
}

/// A single client session.
pub struct Connection {
    user: Username,
    hub: HubHandle,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        user: Username,
        hub: HubHandle,
        settings: ConnectionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            user,
            hub,
            settings,
            shutdown,
        }
    }

    /// Runs the session until the socket ends.
    ///
    /// Always deregisters from the hub before returning if registration
    /// succeeded.
    pub async fn run(self, mut socket: WebSocket) -> Result<(), ConnectionError> {
        let (sender, queue) = mpsc::channel(self.settings.outbound_queue);
        let handle = ConnectionHandle::new(self.user.clone(), sender);
        let id = handle.id();
        let evicted = handle.evicted.clone();

        let others = match self.hub.register(handle).await {
            Ok(others) => others,
            Err(e) => {
                warn!(user = %self.user, error = %e, "Registration refused");
                let _ = socket
                    .send(close_frame(CLOSE_TRY_AGAIN_LATER, "try again later"))
                    .await;
                return Err(ConnectionError::Registration(e));
            }
        };

        info!(user = %self.user, connection_id = %id, online = others.len() + 1, "Session started");

        let signals = Signals {
            evicted,
            closer: self.shutdown.child_token(),
            shutdown: self.shutdown.clone(),
        };
        let (sink, stream) = socket.split();

        // Snapshot of who was already online, ahead of anything queued since
        let snapshot = others
            .into_iter()
            .map(|user| ServerMessage::presence(user, true))
            .collect();

        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            snapshot,
            self.settings.ping_interval,
            signals.clone(),
        ));

        let read_result = self.read_loop(stream, id, &signals).await;

        self.hub.deregister(self.user.clone(), id).await;
        signals.closer.cancel();

        let write_result = match writer.await {
            Ok(result) => result,
            Err(e) => {
                warn!(user = %self.user, error = %e, "Write task panicked or was cancelled");
                Ok(())
            }
        };

        // A clean read exit means something else closed the session; surface
        // the writer's error if it was the cause.
        match read_result {
            Ok(()) => write_result,
            Err(e) => Err(e),
        }
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        id: ConnectionId,
        signals: &Signals,
    ) -> Result<(), ConnectionError> {
        let idle = self.settings.idle_timeout;

        loop {
            let next = tokio::select! {
                biased;

                _ = signals.evicted.cancelled() => return Err(ConnectionError::Evicted),
                _ = signals.closer.cancelled() => return Ok(()),
                next = timeout(idle, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => return Err(ConnectionError::IdleTimeout(idle)),
                Ok(None) => return Err(ConnectionError::Closed),
                Ok(Some(Err(e))) => return Err(ConnectionError::ReadFailure(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => self.handle_text(id, text.as_str()).await,
                Message::Close(frame) => {
                    debug!(user = %self.user, frame = ?frame, "Client sent close");
                    return Err(ConnectionError::Closed);
                }
                Message::Binary(data) => {
                    debug!(user = %self.user, len = data.len(), "Ignoring binary frame");
                }
                // Pings are answered by the transport; both only refresh the idle timer
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn handle_text(&self, id: ConnectionId, text: &str) {
        match decode_client(text, self.settings.max_message_bytes) {
            Ok(message) => {
                debug!(user = %self.user, message_type = message.type_name(), "Received message");
                self.hub.route(self.user.clone(), id, message).await;
            }
            Err(e) => {
                warn!(user = %self.user, error = %e, "Dropping invalid message");
            }
        }
    }
}

// ============================================================================
// Write task
// ============================================================================

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<ServerMessage>,
    snapshot: Vec<ServerMessage>,
    ping_interval: Duration,
    signals: Signals,
) -> Result<(), ConnectionError> {
    let result = write_frames(&mut sink, &mut queue, snapshot, ping_interval, &signals).await;
    if result.is_err() {
        signals.closer.cancel();
    }
    result
}

async fn write_frames(
    sink: &mut SplitSink<WebSocket, Message>,
    queue: &mut mpsc::Receiver<ServerMessage>,
    snapshot: Vec<ServerMessage>,
    ping_interval: Duration,
    signals: &Signals,
) -> Result<(), ConnectionError> {
    for msg in snapshot {
        send_message(sink, msg).await?;
    }

    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = signals.evicted.cancelled() => {
                close(sink, CLOSE_REPLACED, "replaced by a newer connection").await;
                return Ok(());
            }

            _ = signals.closer.cancelled() => {
                if signals.shutdown.is_cancelled() {
                    close(sink, CLOSE_GOING_AWAY, "server shutting down").await;
                } else {
                    close(sink, CLOSE_NORMAL, "").await;
                }
                return Ok(());
            }

            msg = queue.recv() => match msg {
                Some(msg) => send_message(sink, msg).await?,
                None => {
                    close(sink, CLOSE_NORMAL, "").await;
                    return Ok(());
                }
            },

            _ = ping.tick() => send_frame(sink, Message::Ping(Default::default())).await?,
        }
    }
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<(), ConnectionError> {
    match encode_server(msg) {
        Ok(text) => send_frame(sink, Message::Text(text.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode outbound message");
            Ok(())
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
) -> Result<(), ConnectionError> {
    match timeout(WRITE_TIMEOUT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::WriteFailure(e.to_string())),
        Err(_) => Err(ConnectionError::WriteFailure("write timed out".to_string())),
    }
}

/// Best-effort close; the peer may already be gone.
async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = timeout(WRITE_TIMEOUT, sink.send(close_frame(code, reason))).await;
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a session ends.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    ReadFailure(String),

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("no frames received for {0:?}")]
    IdleTimeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("replaced by a newer connection")]
    Evicted,

    #[error("registration refused: {0}")]
    Registration(#[from] HubError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_get_distinct_ids() {
        let (tx, _rx) = mpsc::channel(1);
        let a = ConnectionHandle::new(Username::new("alice"), tx.clone());
        let b = ConnectionHandle::new(Username::new("alice"), tx);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_evict_is_visible_through_clones() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(Username::new("alice"), tx);
        let stored = handle.clone();

        assert!(!handle.is_evicted());
        stored.evict();
        assert!(handle.is_evicted());
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(Username::new("alice"), tx);
        let msg = ServerMessage::presence(Username::new("bob"), true);

        assert!(handle.try_send(msg.clone()).is_ok());
        assert!(matches!(handle.try_send(msg), Err(TrySendError::Full(_))));
    }

    #[test]
    fn test_try_send_reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ConnectionHandle::new(Username::new("alice"), tx);

        let result = handle.try_send(ServerMessage::presence(Username::new("bob"), true));
        assert!(matches!(result, Err(TrySendError::Closed(_))));
    }

    #[test]
    fn test_default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.outbound_queue, 64);
        assert!(settings.idle_timeout > settings.ping_interval);
        assert_eq!(settings.max_message_bytes, 65536);
    }

    #[test]
    fn test_registration_error_display() {
        let err = ConnectionError::from(HubError::HubFull { max: 5 });
        assert!(err.to_string().contains("max: 5"));
    }
}

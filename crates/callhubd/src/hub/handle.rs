//! Client interface for interacting with the HubActor.
//!
//! The `HubHandle` is a cheap-to-clone interface for sending commands to the
//! hub actor. Channel errors are mapped to `HubError::ChannelClosed` for
//! request/response calls and logged for fire-and-forget ones.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use callhub_core::{CallId, ConnectionId, Username};
use callhub_protocol::ClientMessage;

use super::commands::{HubCommand, HubError, HubStats};
use crate::server::ConnectionHandle;

// ============================================================================
// Hub Handle
// ============================================================================

/// Handle for interacting with the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Create a new hub handle.
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    /// Admit a connection, returning the other users already online.
    ///
    /// # Errors
    ///
    /// - `HubError::HubFull` if the hub is at capacity
    /// - `HubError::ChannelClosed` if the actor has shut down
    pub async fn register(&self, connection: ConnectionHandle) -> Result<Vec<Username>, HubError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(HubCommand::Register {
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| HubError::ChannelClosed)?;

        rx.await.map_err(|_| HubError::ChannelClosed)?
    }

    /// Remove a connection. A no-op if it has already been replaced.
    pub async fn deregister(&self, user: Username, connection_id: ConnectionId) {
        if self
            .sender
            .send(HubCommand::Deregister {
                user,
                connection_id,
            })
            .await
            .is_err()
        {
            debug!(connection_id = %connection_id, "Hub gone, skipping deregistration");
        }
    }

    /// Submit a decoded client message for dispatch.
    pub async fn route(&self, sender: Username, connection_id: ConnectionId, message: ClientMessage) {
        if self
            .sender
            .send(HubCommand::Route {
                sender,
                connection_id,
                message,
            })
            .await
            .is_err()
        {
            debug!(connection_id = %connection_id, "Hub gone, dropping message");
        }
    }

    /// Users currently online, sorted.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn online_users(&self) -> Vec<Username> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(HubCommand::OnlineUsers { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// The call `user` is engaged in, if any.
    pub async fn call_of(&self, user: Username) -> Option<CallId> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(HubCommand::CallOf {
                user,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Read hub counters.
    ///
    /// # Errors
    ///
    /// - `HubError::ChannelClosed` if the actor has shut down
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(HubCommand::Stats { respond_to: tx })
            .await
            .map_err(|_| HubError::ChannelClosed)?;

        rx.await.map_err(|_| HubError::ChannelClosed)
    }

    /// Returns true if the actor is no longer accepting commands.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

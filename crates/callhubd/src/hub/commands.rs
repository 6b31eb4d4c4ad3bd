//! Hub actor commands and errors.
//!
//! This module defines the message types for communicating with the `HubActor`:
//! - `HubCommand`: Commands sent to the actor
//! - `HubError`: Errors that can occur during hub operations
//! - `HubStats`: Point-in-time counters for health reporting

use callhub_core::{CallId, ConnectionId, Username};
use callhub_protocol::ClientMessage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::server::ConnectionHandle;

// ============================================================================
// Hub Commands
// ============================================================================

/// Commands sent to the hub actor.
///
/// Queries carry a oneshot channel for the response. `Deregister` and
/// `Route` are fire-and-forget.
#[derive(Debug)]
pub enum HubCommand {
    /// Admit a connection under its username.
    ///
    /// Replies with the other users online at the moment of admission.
    ///
    /// # Errors
    /// - `HubError::HubFull` if the username is new and the hub is at capacity
    Register {
        /// Handle of the connection being admitted
        connection: ConnectionHandle,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<Vec<Username>, HubError>>,
    },

    /// Remove a connection, if it is still the current one for `user`.
    Deregister {
        user: Username,
        connection_id: ConnectionId,
    },

    /// Dispatch a message sent by `sender` over connection `connection_id`.
    Route {
        sender: Username,
        connection_id: ConnectionId,
        message: ClientMessage,
    },

    /// List users currently online, sorted.
    OnlineUsers {
        respond_to: oneshot::Sender<Vec<Username>>,
    },

    /// Look up the call a user is engaged in.
    CallOf {
        user: Username,
        respond_to: oneshot::Sender<Option<CallId>>,
    },

    /// Read hub counters.
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
}

// ============================================================================
// Hub Errors
// ============================================================================

/// Errors that can occur during hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The hub has reached its maximum number of online users.
    #[error("hub is full (max: {max} clients)")]
    HubFull {
        /// Maximum number of users allowed online
        max: usize,
    },

    /// The actor is gone.
    ///
    /// This typically indicates the hub was shut down.
    #[error("hub channel closed")]
    ChannelClosed,
}

// ============================================================================
// Hub Stats
// ============================================================================

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Users with a live connection
    pub online: usize,
    /// Users engaged in a call (ringing or active)
    pub in_call: usize,
}

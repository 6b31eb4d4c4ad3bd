//! Session hub using the Actor pattern.
//!
//! The hub is the single authority over who is online and who is in a call.
//! Connections submit `HubCommand`s over an mpsc channel; the actor mutates
//! its state and enqueues outbound messages on the affected connections'
//! queues without ever waiting on them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  HubCommand   ┌─────────────────┐  try_send   ┌─────────────────┐
//! │   Connection    │──────────────▶│    HubActor     │────────────▶│ Connection queue│
//! │   (read task)   │    (mpsc)     │                 │             │  (write task)   │
//! └─────────────────┘               └────────┬────────┘             └─────────────────┘
//!                                            │ tokio::spawn
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │ OfflineNotifier │
//!                                   └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::HubActor;
pub use commands::{HubCommand, HubError, HubStats};
pub use handle::HubHandle;

use crate::notify::{OfflineNotifier, TokenRegistry};

/// Command channel buffer size
const COMMAND_BUFFER: usize = 1024;

/// Default maximum number of distinct users online
pub const DEFAULT_MAX_CLIENTS: usize = 10_000;

/// Tunables for the hub actor.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Maximum number of distinct users online
    pub max_clients: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// Spawn the hub actor and return a handle for interaction.
///
/// The actor runs until every `HubHandle` has been dropped.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use callhubd::hub::{spawn_hub, HubSettings};
/// use callhubd::notify::{DisabledNotifier, TokenRegistry};
///
/// #[tokio::main]
/// async fn main() {
///     let hub = spawn_hub(HubSettings::default(), TokenRegistry::default(), Arc::new(DisabledNotifier));
///     let online = hub.online_users().await;
/// }
/// ```
pub fn spawn_hub(
    settings: HubSettings,
    tokens: TokenRegistry,
    notifier: Arc<dyn OfflineNotifier>,
) -> HubHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = HubActor::new(cmd_rx, tokens, notifier, settings.max_clients);
    tokio::spawn(actor.run());

    HubHandle::new(cmd_tx)
}

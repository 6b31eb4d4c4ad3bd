//! Hub actor - owns presence and call state and processes commands.
//!
//! The HubActor is the single owner of the client registry and the call
//! table. Connections reach it only through `HubCommand`s, so every
//! check-then-mutate sequence (the busy check before a call reservation in
//! particular) runs without interleaving.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Delivery uses `try_send`; a full or closed client queue drops the message
//! - Notifier failures are logged on their own task

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use callhub_core::{CallId, ConnectionId, Username};
use callhub_protocol::{ClientMessage, RelayMessage, ServerMessage};

use super::commands::{HubCommand, HubError, HubStats};
use crate::notify::{call_initiate_payload, OfflineNotifier, TokenRegistry};
use crate::server::ConnectionHandle;

// ============================================================================
// Hub Actor
// ============================================================================

/// The hub actor - owns all session state.
///
/// # Ownership
///
/// The actor owns:
/// - `clients`: the live connection for each online username
/// - `active_calls`: the call each engaged username belongs to
///
/// The notification address registry is shared with the ingress, which
/// records addresses before a connection registers.
pub struct HubActor {
    /// Command receiver
    receiver: mpsc::Receiver<HubCommand>,

    /// At most one live connection per username
    clients: HashMap<Username, ConnectionHandle>,

    /// Present iff the user is ringing or in an active call
    active_calls: HashMap<Username, CallId>,

    /// Push addresses for offline delivery
    tokens: TokenRegistry,

    /// Offline delivery collaborator
    notifier: Arc<dyn OfflineNotifier>,

    /// Maximum number of distinct users online
    max_clients: usize,
}

impl HubActor {
    /// Creates a new hub actor.
    pub fn new(
        receiver: mpsc::Receiver<HubCommand>,
        tokens: TokenRegistry,
        notifier: Arc<dyn OfflineNotifier>,
        max_clients: usize,
    ) -> Self {
        Self {
            receiver,
            clients: HashMap::new(),
            active_calls: HashMap::new(),
            tokens,
            notifier,
            max_clients,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all handles dropped).
    pub async fn run(mut self) {
        info!(max_clients = self.max_clients, "Hub actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            online = self.clients.len(),
            in_call = self.active_calls.len(),
            "Hub actor stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                connection,
                respond_to,
            } => {
                let result = self.handle_register(connection);
                // Ignore send error - the connection may have gone away
                let _ = respond_to.send(result);
            }
            HubCommand::Deregister {
                user,
                connection_id,
            } => {
                self.handle_deregister(user, connection_id);
            }
            HubCommand::Route {
                sender,
                connection_id,
                message,
            } => {
                self.handle_route(sender, connection_id, message);
            }
            HubCommand::OnlineUsers { respond_to } => {
                let mut users: Vec<Username> = self.clients.keys().cloned().collect();
                users.sort();
                let _ = respond_to.send(users);
            }
            HubCommand::CallOf { user, respond_to } => {
                let _ = respond_to.send(self.active_calls.get(&user).cloned());
            }
            HubCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, connection: ConnectionHandle) -> Result<Vec<Username>, HubError> {
        let user = connection.user().clone();

        match self.clients.get(&user) {
            Some(existing) if existing.id() == connection.id() => {
                debug!(user = %user, connection_id = %connection.id(), "Connection already registered");
                return Ok(self.others(&user));
            }
            Some(_) => {}
            None if self.clients.len() >= self.max_clients => {
                warn!(user = %user, max = self.max_clients, "Hub full, refusing registration");
                return Err(HubError::HubFull {
                    max: self.max_clients,
                });
            }
            None => {}
        }

        let connection_id = connection.id();
        if let Some(previous) = self.clients.insert(user.clone(), connection) {
            info!(
                user = %user,
                previous = %previous.id(),
                connection_id = %connection_id,
                "Replacing existing connection"
            );
            previous.evict();
        } else {
            info!(user = %user, connection_id = %connection_id, "Client registered");
        }

        self.broadcast(&ServerMessage::presence(user.clone(), true));
        Ok(self.others(&user))
    }

    fn handle_deregister(&mut self, user: Username, connection_id: ConnectionId) {
        if !self.is_current(&user, connection_id) {
            debug!(user = %user, connection_id = %connection_id, "Ignoring stale deregistration");
            return;
        }

        self.clients.remove(&user);
        if let Some(call_id) = self.active_calls.remove(&user) {
            debug!(user = %user, call_id = %call_id, "Cleared call state on disconnect");
        }
        info!(user = %user, connection_id = %connection_id, "Client deregistered");

        self.broadcast(&ServerMessage::presence(user, false));
    }

    fn handle_route(&mut self, sender: Username, connection_id: ConnectionId, message: ClientMessage) {
        if !self.is_current(&sender, connection_id) {
            debug!(
                user = %sender,
                connection_id = %connection_id,
                message_type = message.type_name(),
                "Dropping message from non-current connection"
            );
            return;
        }

        match message {
            ClientMessage::CallRequest { to, call_id } => self.handle_call_request(sender, to, call_id),
            ClientMessage::Relay(relay) => self.handle_relay(sender, relay),
            ClientMessage::CallEnd { call_id } => self.handle_call_end(call_id),
        }
    }

    fn handle_call_request(&mut self, caller: Username, callee: Username, call_id: CallId) {
        if self.active_calls.contains_key(&callee) {
            info!(caller = %caller, callee = %callee, "Callee busy");
            self.deliver(&caller, ServerMessage::busy(caller.clone()));
            return;
        }

        self.active_calls.insert(caller.clone(), call_id.clone());
        self.active_calls.insert(callee.clone(), call_id.clone());
        info!(caller = %caller, callee = %callee, call_id = %call_id, "Call requested");

        if self.clients.contains_key(&callee) {
            self.deliver(&callee, ServerMessage::incoming_call(caller, call_id));
        } else if let Some(address) = self.tokens.get(&callee) {
            self.dispatch_offline(callee, address, caller, call_id);
        } else {
            debug!(callee = %callee, call_id = %call_id, "Callee offline with no push address");
        }
    }

    fn handle_relay(&mut self, sender: Username, relay: RelayMessage) {
        let to = relay.to.clone();
        if !self.clients.contains_key(&to) {
            debug!(from = %sender, to = %to, message_type = %relay.kind, "Relay target offline, dropping");
            return;
        }
        self.deliver(&to, ServerMessage::relayed(sender, relay));
    }

    fn handle_call_end(&mut self, call_id: CallId) {
        let before = self.active_calls.len();
        self.active_calls.retain(|_, id| id != &call_id);
        info!(
            call_id = %call_id,
            released = before - self.active_calls.len(),
            "Call ended"
        );

        self.broadcast(&ServerMessage::call_ended(call_id));
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Enqueues a message for one user without waiting.
    fn deliver(&self, user: &Username, msg: ServerMessage) {
        if let Some(connection) = self.clients.get(user) {
            Self::try_deliver(connection, msg);
        }
    }

    /// Enqueues a copy of the message for every online user.
    fn broadcast(&self, msg: &ServerMessage) {
        for connection in self.clients.values() {
            Self::try_deliver(connection, msg.clone());
        }
    }

    fn try_deliver(connection: &ConnectionHandle, msg: ServerMessage) {
        let message_type = msg.type_name();
        match connection.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    user = %connection.user(),
                    connection_id = %connection.id(),
                    message_type,
                    "Outbound queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    user = %connection.user(),
                    connection_id = %connection.id(),
                    message_type,
                    "Outbound queue closed, dropping message"
                );
            }
        }
    }

    /// Hands a call invitation to the offline notifier on a detached task.
    fn dispatch_offline(&self, callee: Username, address: String, caller: Username, call_id: CallId) {
        let notifier = Arc::clone(&self.notifier);
        let payload = call_initiate_payload(&caller, &call_id);
        debug!(callee = %callee, call_id = %call_id, "Dispatching offline notification");

        tokio::spawn(async move {
            match notifier.notify(&address, payload).await {
                Ok(()) => debug!(callee = %callee, call_id = %call_id, "Offline notification sent"),
                Err(e) => warn!(
                    callee = %callee,
                    call_id = %call_id,
                    error = %e,
                    "Offline notification failed"
                ),
            }
        });
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn is_current(&self, user: &Username, connection_id: ConnectionId) -> bool {
        self.clients
            .get(user)
            .is_some_and(|c| c.id() == connection_id)
    }

    /// Other online users, sorted.
    fn others(&self, user: &Username) -> Vec<Username> {
        let mut users: Vec<Username> = self
            .clients
            .keys()
            .filter(|u| *u != user)
            .cloned()
            .collect();
        users.sort();
        users
    }

    fn stats(&self) -> HubStats {
        HubStats {
            online: self.clients.len(),
            in_call: self.active_calls.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::DisabledNotifier;
    use callhub_protocol::RelayKind;
    use tokio::sync::oneshot;

    fn create_actor(max_clients: usize) -> HubActor {
        let (_, cmd_rx) = mpsc::channel(16);
        HubActor::new(
            cmd_rx,
            TokenRegistry::default(),
            Arc::new(DisabledNotifier),
            max_clients,
        )
    }

    struct TestClient {
        handle: ConnectionHandle,
        queue: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn new(user: &str, capacity: usize) -> Self {
            let (tx, rx) = mpsc::channel(capacity);
            Self {
                handle: ConnectionHandle::new(Username::new(user), tx),
                queue: rx,
            }
        }

        fn id(&self) -> ConnectionId {
            self.handle.id()
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.queue.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn register(actor: &mut HubActor, client: &TestClient) -> Result<Vec<Username>, HubError> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(HubCommand::Register {
            connection: client.handle.clone(),
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn online(actor: &mut HubActor, name: &str) -> TestClient {
        let client = TestClient::new(name, 16);
        register(actor, &client).unwrap();
        client
    }

    fn route(actor: &mut HubActor, client: &TestClient, message: ClientMessage) {
        actor.handle_command(HubCommand::Route {
            sender: client.handle.user().clone(),
            connection_id: client.id(),
            message,
        });
    }

    fn user(name: &str) -> Username {
        Username::new(name)
    }

    #[test]
    fn test_register_broadcasts_presence_to_everyone() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        assert_eq!(
            alice.drain(),
            vec![ServerMessage::presence(user("alice"), true)]
        );

        let mut bob = online(&mut actor, "bob");
        assert_eq!(alice.drain(), vec![ServerMessage::presence(user("bob"), true)]);
        assert_eq!(bob.drain(), vec![ServerMessage::presence(user("bob"), true)]);
        assert_eq!(actor.stats().online, 2);
    }

    #[test]
    fn test_register_returns_other_online_users() {
        let mut actor = create_actor(10);
        let _carol = online(&mut actor, "carol");
        let _alice = online(&mut actor, "alice");

        let bob = TestClient::new("bob", 16);
        let others = register(&mut actor, &bob).unwrap();
        assert_eq!(others, vec![user("alice"), user("carol")]);
    }

    #[test]
    fn test_register_full_hub_is_refused() {
        let mut actor = create_actor(1);
        let _alice = online(&mut actor, "alice");

        let bob = TestClient::new("bob", 16);
        assert_eq!(register(&mut actor, &bob), Err(HubError::HubFull { max: 1 }));

        // Replacing an existing username does not need a free slot
        let alice_again = TestClient::new("alice", 16);
        assert!(register(&mut actor, &alice_again).is_ok());
    }

    #[test]
    fn test_duplicate_username_evicts_previous_connection() {
        let mut actor = create_actor(10);
        let first = online(&mut actor, "alice");
        let second = online(&mut actor, "alice");

        assert!(first.handle.is_evicted());
        assert!(!second.handle.is_evicted());
        assert!(actor.is_current(&user("alice"), second.id()));
        assert_eq!(actor.stats().online, 1);
    }

    #[test]
    fn test_stale_deregister_is_noop() {
        let mut actor = create_actor(10);
        let first = online(&mut actor, "alice");
        let mut second = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        route(&mut actor, &second, ClientMessage::call_request("bob", "c1"));
        second.drain();
        bob.drain();

        actor.handle_command(HubCommand::Deregister {
            user: user("alice"),
            connection_id: first.id(),
        });

        assert!(actor.is_current(&user("alice"), second.id()));
        assert_eq!(actor.active_calls.get(&user("alice")), Some(&CallId::new("c1")));
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_deregister_clears_call_and_broadcasts_offline() {
        let mut actor = create_actor(10);
        let alice = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        route(&mut actor, &alice, ClientMessage::call_request("bob", "c1"));
        bob.drain();

        actor.handle_command(HubCommand::Deregister {
            user: user("alice"),
            connection_id: alice.id(),
        });

        assert!(!actor.clients.contains_key(&user("alice")));
        assert!(!actor.active_calls.contains_key(&user("alice")));
        // The peer keeps its entry until call_end
        assert!(actor.active_calls.contains_key(&user("bob")));
        assert_eq!(bob.drain(), vec![ServerMessage::presence(user("alice"), false)]);

        // Second deregistration is idempotent
        actor.handle_command(HubCommand::Deregister {
            user: user("alice"),
            connection_id: alice.id(),
        });
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_call_request_reserves_both_and_rings_callee() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        alice.drain();
        bob.drain();

        route(&mut actor, &alice, ClientMessage::call_request("bob", "c1"));

        assert_eq!(
            bob.drain(),
            vec![ServerMessage::incoming_call(user("alice"), CallId::new("c1"))]
        );
        assert!(alice.drain().is_empty());
        assert_eq!(actor.active_calls.get(&user("alice")), Some(&CallId::new("c1")));
        assert_eq!(actor.active_calls.get(&user("bob")), Some(&CallId::new("c1")));
    }

    #[test]
    fn test_call_request_to_busy_callee() {
        let mut actor = create_actor(10);
        let alice = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        let mut carol = online(&mut actor, "carol");
        route(&mut actor, &alice, ClientMessage::call_request("bob", "c1"));
        bob.drain();
        carol.drain();

        route(&mut actor, &carol, ClientMessage::call_request("bob", "c2"));

        assert_eq!(carol.drain(), vec![ServerMessage::busy(user("carol"))]);
        assert!(bob.drain().is_empty());
        assert!(!actor.active_calls.contains_key(&user("carol")));
        assert_eq!(actor.active_calls.get(&user("bob")), Some(&CallId::new("c1")));
    }

    #[test]
    fn test_call_request_to_self_rings_caller() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        alice.drain();

        route(&mut actor, &alice, ClientMessage::call_request("alice", "c1"));

        assert_eq!(
            alice.drain(),
            vec![ServerMessage::incoming_call(user("alice"), CallId::new("c1"))]
        );
        assert_eq!(actor.active_calls.get(&user("alice")), Some(&CallId::new("c1")));
        assert_eq!(actor.stats().in_call, 1);

        // Now engaged, so a second attempt is answered with busy
        route(&mut actor, &alice, ClientMessage::call_request("alice", "c2"));
        assert_eq!(alice.drain(), vec![ServerMessage::busy(user("alice"))]);
    }

    #[test]
    fn test_call_request_to_unknown_offline_user() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        alice.drain();

        route(&mut actor, &alice, ClientMessage::call_request("dave", "c1"));

        assert!(alice.drain().is_empty());
        assert_eq!(actor.stats().in_call, 2);
    }

    #[test]
    fn test_relay_stamps_sender_and_preserves_payload() {
        let mut actor = create_actor(10);
        let alice = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        bob.drain();

        let data = serde_json::json!({"sdp": "v=0"});
        route(
            &mut actor,
            &alice,
            ClientMessage::relay(RelayKind::SdpOffer, "bob", Some(data.clone())),
        );

        assert_eq!(
            bob.drain(),
            vec![ServerMessage::Relay {
                kind: RelayKind::SdpOffer,
                from: user("alice"),
                to: user("bob"),
                call_id: None,
                data: Some(data),
            }]
        );
    }

    #[test]
    fn test_relay_to_offline_user_is_dropped() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        alice.drain();

        route(&mut actor, &alice, ClientMessage::relay(RelayKind::CallAccept, "bob", None));

        assert!(alice.drain().is_empty());
        assert!(actor.active_calls.is_empty());
    }

    #[test]
    fn test_call_end_releases_all_participants_and_broadcasts() {
        let mut actor = create_actor(10);
        let alice = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        let mut carol = online(&mut actor, "carol");
        route(&mut actor, &alice, ClientMessage::call_request("bob", "c1"));
        bob.drain();
        carol.drain();

        route(&mut actor, &alice, ClientMessage::call_end("c1"));

        assert!(actor.active_calls.is_empty());
        assert_eq!(bob.drain(), vec![ServerMessage::call_ended(CallId::new("c1"))]);
        assert_eq!(carol.drain(), vec![ServerMessage::call_ended(CallId::new("c1"))]);
    }

    #[test]
    fn test_call_end_unknown_call_still_broadcasts() {
        let mut actor = create_actor(10);
        let mut alice = online(&mut actor, "alice");
        alice.drain();

        route(&mut actor, &alice, ClientMessage::call_end("nope"));

        assert_eq!(alice.drain(), vec![ServerMessage::call_ended(CallId::new("nope"))]);
    }

    #[test]
    fn test_route_from_replaced_connection_is_dropped() {
        let mut actor = create_actor(10);
        let first = online(&mut actor, "alice");
        let _second = online(&mut actor, "alice");
        let mut bob = online(&mut actor, "bob");
        bob.drain();

        route(&mut actor, &first, ClientMessage::call_request("bob", "c1"));

        assert!(bob.drain().is_empty());
        assert!(actor.active_calls.is_empty());
    }

    #[test]
    fn test_full_queue_does_not_block_other_clients() {
        let mut actor = create_actor(10);
        let slow = TestClient::new("slow", 1);
        register(&mut actor, &slow).unwrap();
        let mut fast = online(&mut actor, "fast");
        fast.drain();

        // `slow` still holds its own presence message, so its queue is full
        route(&mut actor, &fast, ClientMessage::call_end("c1"));
        route(&mut actor, &fast, ClientMessage::call_end("c2"));

        assert_eq!(fast.drain().len(), 2);
    }

    #[test]
    fn test_queries() {
        let mut actor = create_actor(10);
        let alice = online(&mut actor, "alice");
        let _bob = online(&mut actor, "bob");
        route(&mut actor, &alice, ClientMessage::call_request("bob", "c1"));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(HubCommand::OnlineUsers { respond_to: tx });
        assert_eq!(rx.try_recv().unwrap(), vec![user("alice"), user("bob")]);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(HubCommand::CallOf {
            user: user("bob"),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Some(CallId::new("c1")));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(HubCommand::Stats { respond_to: tx });
        assert_eq!(
            rx.try_recv().unwrap(),
            HubStats {
                online: 2,
                in_call: 2
            }
        );
    }
}

//! Offline delivery of call invitations.
//!
//! When a call is requested for a user with no live connection, the hub
//! looks up the push address the user last connected with and hands a
//! small string map to an [`OfflineNotifier`] on a detached task.
//! Failures are logged and otherwise ignored.

mod fcm;

pub use fcm::{build_message, FcmNotifier, ServiceAccount, FCM_SCOPE};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use callhub_core::{CallId, Username};

/// Payload `type` for an offline call invitation
pub const CALL_INITIATE: &str = "call_initiate";

// ============================================================================
// Notifier trait
// ============================================================================

/// Delivers a string map to a device push address.
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    /// Sends `payload` to `address`.
    async fn notify(&self, address: &str, payload: HashMap<String, String>) -> Result<(), NotifyError>;
}

/// Notifier used when no push provider is configured.
///
/// Accepts every notification and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl OfflineNotifier for DisabledNotifier {
    async fn notify(&self, address: &str, payload: HashMap<String, String>) -> Result<(), NotifyError> {
        debug!(
            address_len = address.len(),
            payload_type = payload.get("type").map(String::as_str).unwrap_or_default(),
            "Push notifications not configured, dropping notification"
        );
        Ok(())
    }
}

/// Builds the payload announcing a call from `caller`.
pub fn call_initiate_payload(caller: &Username, call_id: &CallId) -> HashMap<String, String> {
    HashMap::from([
        ("type".to_string(), CALL_INITIATE.to_string()),
        ("uuid".to_string(), call_id.to_string()),
        ("callerName".to_string(), caller.to_string()),
        ("callerHandle".to_string(), caller.to_string()),
    ])
}

// ============================================================================
// Token registry
// ============================================================================

/// Last known push address per user.
///
/// Written by the ingress when a client connects with a token, read by the
/// hub when a callee is offline. Entries survive disconnects and are
/// overwritten by newer tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    inner: Arc<RwLock<HashMap<Username, String>>>,
}

impl TokenRegistry {
    /// Records `address` for `user`, replacing any previous one.
    pub fn set(&self, user: Username, address: impl Into<String>) {
        let mut tokens = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(user, address.into());
    }

    /// Returns the address recorded for `user`.
    pub fn get(&self, user: &Username) -> Option<String> {
        let tokens = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        tokens.get(user).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or invoking a push provider.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to read credentials at {path}: {reason}")]
    CredentialsRead { path: String, reason: String },

    #[error("failed to parse credentials: {reason}")]
    CredentialsParse { reason: String },

    #[error("failed to parse private key: {reason}")]
    KeyParse { reason: String },

    #[error("failed to sign JWT: {reason}")]
    JwtSign { reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("access token exchange failed: {reason}")]
    TokenExchange { reason: String },

    #[error("push provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_initiate_payload_keys() {
        let payload = call_initiate_payload(&Username::new("alice"), &CallId::new("c1"));
        assert_eq!(payload.len(), 4);
        assert_eq!(payload["type"], "call_initiate");
        assert_eq!(payload["uuid"], "c1");
        assert_eq!(payload["callerName"], "alice");
        assert_eq!(payload["callerHandle"], "alice");
    }

    #[test]
    fn test_token_registry_overwrites() {
        let tokens = TokenRegistry::default();
        assert!(tokens.is_empty());

        tokens.set(Username::new("bob"), "token-1");
        tokens.set(Username::new("bob"), "token-2");

        assert_eq!(tokens.get(&Username::new("bob")).as_deref(), Some("token-2"));
        assert_eq!(tokens.get(&Username::new("carol")), None);
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_token_registry_shared_between_clones() {
        let tokens = TokenRegistry::default();
        let other = tokens.clone();
        other.set(Username::new("bob"), "t");
        assert_eq!(tokens.get(&Username::new("bob")).as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_disabled_notifier_accepts() {
        let payload = call_initiate_payload(&Username::new("alice"), &CallId::new("c1"));
        assert!(DisabledNotifier.notify("token", payload).await.is_ok());
    }

    #[test]
    fn test_rejected_display() {
        let err = NotifyError::Rejected {
            status: 404,
            body: "UNREGISTERED".to_string(),
        };
        assert_eq!(err.to_string(), "push provider rejected message (404): UNREGISTERED");
    }
}

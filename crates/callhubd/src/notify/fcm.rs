//! Firebase Cloud Messaging (HTTP v1) notifier.
//!
//! Uses `jsonwebtoken` to sign an RS256 service-account assertion, exchanges
//! it for an OAuth2 access token, and sends data-only messages with `reqwest`.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{NotifyError, OfflineNotifier};

/// OAuth2 scope for sending FCM messages.
pub const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for the signed assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Access tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The fields of a Google service-account key file the notifier needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

/// JWT claims for the OAuth2 JWT-bearer grant.
#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Cached access token with expiry tracking.
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Sends call invitations through FCM.
pub struct FcmNotifier {
    account: ServiceAccount,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    send_url: String,
    cached_token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for FcmNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmNotifier")
            .field("account", &self.account)
            .field("send_url", &self.send_url)
            .finish_non_exhaustive()
    }
}

impl FcmNotifier {
    /// Loads a notifier from a service-account JSON key file.
    pub fn from_credentials_file(path: &Path) -> Result<Self, NotifyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| NotifyError::CredentialsRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let account: ServiceAccount =
            serde_json::from_str(&raw).map_err(|e| NotifyError::CredentialsParse {
                reason: e.to_string(),
            })?;

        Self::new(account)
    }

    /// Builds a notifier from already-parsed credentials.
    pub fn new(account: ServiceAccount) -> Result<Self, NotifyError> {
        let encoding_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| NotifyError::KeyParse {
                reason: e.to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let send_url = format!(
            "{FCM_ENDPOINT}/v1/projects/{}/messages:send",
            account.project_id
        );

        info!(
            project_id = %account.project_id,
            client_email = %account.client_email,
            "FCM notifier initialized"
        );

        Ok(Self {
            account,
            encoding_key,
            client,
            send_url,
            cached_token: Mutex::new(None),
        })
    }

    /// Overrides the base URL messages are posted to.
    pub fn with_endpoint(mut self, base: &str) -> Self {
        self.send_url = format!(
            "{}/v1/projects/{}/messages:send",
            base.trim_end_matches('/'),
            self.account.project_id
        );
        self
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    /// Get a cached access token or exchange a fresh assertion for one.
    ///
    /// The lock is held across the exchange so concurrent sends share it.
    async fn access_token(&self) -> Result<String, NotifyError> {
        let mut cached = self.cached_token.lock().await;

        if let Some(ref token) = *cached {
            if Instant::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let assertion = self.sign_assertion()?;
        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::TokenExchange {
                reason: format!("{}: {body}", status.as_u16()),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::TokenExchange {
                reason: e.to_string(),
            })?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in = token.expires_in, "Obtained FCM access token");

        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    /// Signs the RS256 JWT-bearer assertion.
    fn sign_assertion(&self) -> Result<String, NotifyError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: &self.account.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key).map_err(
            |e| NotifyError::JwtSign {
                reason: e.to_string(),
            },
        )
    }
}

#[async_trait]
impl OfflineNotifier for FcmNotifier {
    async fn notify(&self, address: &str, payload: HashMap<String, String>) -> Result<(), NotifyError> {
        let token = self.access_token().await?;
        let body = build_message(address, &payload);

        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "FCM request failed (transport error)");
                NotifyError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "FCM send OK");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Builds the HTTP v1 request body for a data-only, high-priority message.
///
/// The APNs headers wake a backgrounded iOS app so it can surface the call.
pub fn build_message(address: &str, data: &HashMap<String, String>) -> serde_json::Value {
    serde_json::json!({
        "message": {
            "token": address,
            "data": data,
            "android": {
                "priority": "high",
            },
            "apns": {
                "headers": {
                    "apns-priority": "10",
                },
                "payload": {
                    "aps": {
                        "content-available": 1,
                    },
                },
            },
        }
    })
}

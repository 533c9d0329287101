//! Bearer credential storage and session lifecycle events

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::local_store::{LocalStore, LocalStoreResult, keys};

const BEARER_PREFIX: &str = "Bearer ";
const SESSION_EVENT_CAPACITY: usize = 16;

/// Broadcast to collaborators when the session changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedIn,
    /// Credentials were cleared; the UI should route to its login screen.
    LoginRequired { reason: String },
}

/// Reads and writes the bearer token kept in the local store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    store: Arc<LocalStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl CredentialStore {
    pub fn new(store: Arc<LocalStore>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Raw token as stored, if any.
    pub fn token(&self) -> Option<String> {
        self.store
            .get_string(keys::TOKEN)
            .filter(|token| !token.trim().is_empty())
    }

    /// `Authorization` header value, never double-prefixed.
    pub fn authorization_header(&self) -> Option<String> {
        self.token().map(|token| normalize_bearer(&token))
    }

    pub fn store_token(&self, token: &str) -> LocalStoreResult<()> {
        let bare = token.trim().strip_prefix(BEARER_PREFIX).unwrap_or(token.trim());
        self.store.set(keys::TOKEN, &bare)?;
        info!("🔑 Credential stored");
        let _ = self.events.send(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Clears token and user info, then signals that a login is required.
    pub fn invalidate_session(&self, reason: &str) {
        for key in [keys::TOKEN, keys::USER_INFO] {
            if let Err(e) = self.store.remove(key) {
                warn!("Failed to clear '{}' during session reset: {}", key, e);
            }
        }
        warn!("🔒 Session invalidated: {}", reason);
        let _ = self.events.send(SessionEvent::LoginRequired {
            reason: reason.to_string(),
        });
    }
}

pub fn normalize_bearer(token: &str) -> String {
    let token = token.trim();
    if token.starts_with(BEARER_PREFIX) {
        token.to_string()
    } else {
        format!("{BEARER_PREFIX}{token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_not_doubled() {
        assert_eq!(normalize_bearer("abc"), "Bearer abc");
        assert_eq!(normalize_bearer("Bearer abc"), "Bearer abc");
        assert_eq!(normalize_bearer("  abc "), "Bearer abc");
    }

    #[test]
    fn stored_token_is_kept_bare() {
        let creds = CredentialStore::new(Arc::new(LocalStore::in_memory()));
        creds.store_token("Bearer xyz").unwrap();
        assert_eq!(creds.token().as_deref(), Some("xyz"));
        assert_eq!(creds.authorization_header().as_deref(), Some("Bearer xyz"));
    }

    #[tokio::test]
    async fn invalidation_clears_and_notifies() {
        let store = Arc::new(LocalStore::in_memory());
        store.set(keys::USER_INFO, &serde_json::json!({"name": "ops"})).unwrap();
        let creds = CredentialStore::new(store.clone());
        creds.store_token("t").unwrap();
        let mut events = creds.subscribe();

        creds.invalidate_session("HTTP 401");

        assert!(creds.token().is_none());
        assert!(!store.contains(keys::USER_INFO));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoginRequired {
                reason: "HTTP 401".into()
            }
        );
    }
}

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use shared::auth::LoginResponse;
use tokio::sync::RwLock;

/// Access/refresh token pair issued by the last successful login or refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expiry: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.access_expiry <= now
    }

    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.access_expiry <= now + window
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expiry", &self.access_expiry)
            .finish()
    }
}

impl From<LoginResponse> for Credential {
    fn from(value: LoginResponse) -> Self {
        Self {
            access_token: value.access_token,
            refresh_token: value.refresh_token,
            access_expiry: value.access_token_expires_at,
        }
    }
}

/// Holder of the session's current credential.
///
/// Writers: the refresh coordinator (refresh success and failure, only over the
/// credential it started from) and the session (login and logout). Everything
/// else only reads. The credential is always replaced as a whole.
#[derive(Default)]
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
        }
    }

    pub async fn get(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credential| credential.refresh_token.clone())
    }

    pub async fn set(&self, credential: Credential) {
        *self.current.write().await = Some(credential);
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    /// Installs `next` only while the store still holds `expected`.
    pub async fn replace_if(&self, expected: &Credential, next: Credential) -> bool {
        let mut current = self.current.write().await;
        if current.as_ref() != Some(expected) {
            return false;
        }
        *current = Some(next);
        true
    }

    /// Clears the store only while it still holds `expected`.
    pub async fn clear_if(&self, expected: &Credential) -> bool {
        let mut current = self.current.write().await;
        if current.as_ref() != Some(expected) {
            return false;
        }
        *current = None;
        true
    }

    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_none()
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;

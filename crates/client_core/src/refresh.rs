use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::Client;
use shared::auth::{RefreshRequest, RefreshResponse};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    credentials::{Credential, CredentialStore},
    error::RefreshError,
    ClientEvent,
};

/// Network side of a token refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, RefreshError>;
}

/// Posts `{refresh_token}` to the backend's refresh endpoint.
pub struct HttpTokenRefresher {
    http: Client,
    endpoint: Url,
}

impl HttpTokenRefresher {
    pub fn new(http: Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, RefreshError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await
            .map_err(|err| RefreshError::Network(err.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }
        res.json::<RefreshResponse>()
            .await
            .map_err(|err| RefreshError::Network(format!("invalid refresh response: {err}")))
    }
}

type RefreshFlight = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// Serializes token refreshes: concurrent callers share one in-flight refresh.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    events: broadcast::Sender<ClientEvent>,
    in_flight: Arc<Mutex<Option<RefreshFlight>>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            refresher,
            events,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Refreshes the access token, or joins the refresh already in flight.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        self.refresh_after(None).await
    }

    /// Like [`refresh`](Self::refresh), for a caller whose request was rejected
    /// while carrying `rejected`. If the store already holds a different access
    /// token, a refresh completed after that request was sent and its token is
    /// returned without another network call.
    pub async fn refresh_after(&self, rejected: Option<&str>) -> Result<String, RefreshError> {
        let flight = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(flight) if flight.peek().is_none() => {
                    debug!("refresh: joining in-flight refresh");
                    flight.clone()
                }
                _ => {
                    if let Some(rejected) = rejected {
                        if let Some(current) = self.store.access_token().await {
                            if current != rejected {
                                debug!("refresh: token already rotated, reusing it");
                                return Ok(current);
                            }
                        }
                    }
                    let flight = self.start_flight();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    pub async fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .await
            .as_ref()
            .is_some_and(|flight| flight.peek().is_none())
    }

    fn start_flight(&self) -> RefreshFlight {
        let store = Arc::clone(&self.store);
        let refresher = Arc::clone(&self.refresher);
        let events = self.events.clone();
        let slot = Arc::clone(&self.in_flight);
        let task = tokio::spawn(async move {
            let result = run_refresh(&store, refresher.as_ref(), &events).await;
            slot.lock().await.take();
            result
        });
        async move { task.await.unwrap_or(Err(RefreshError::Aborted)) }
            .boxed()
            .shared()
    }
}

async fn run_refresh(
    store: &CredentialStore,
    refresher: &dyn TokenRefresher,
    events: &broadcast::Sender<ClientEvent>,
) -> Result<String, RefreshError> {
    // Nothing to expire: either never signed in or already signed out.
    let Some(current) = store.get().await else {
        debug!("refresh: no credential to refresh");
        return Err(RefreshError::MissingRefreshToken);
    };

    match refresher.refresh(&current.refresh_token).await {
        Ok(refreshed) => {
            let rotated = refreshed.refresh_token.is_some();
            let credential = Credential {
                access_token: refreshed.access_token,
                refresh_token: refreshed
                    .refresh_token
                    .unwrap_or_else(|| current.refresh_token.clone()),
                access_expiry: refreshed.access_token_expires_at,
            };
            let access_token = credential.access_token.clone();
            if !store.replace_if(&current, credential).await {
                info!("refresh: credential changed while refreshing, result discarded");
                return store.access_token().await.ok_or(RefreshError::Superseded);
            }
            info!(
                rotated_refresh_token = rotated,
                expires_at = %refreshed.access_token_expires_at,
                "refresh: access token renewed"
            );
            Ok(access_token)
        }
        Err(err) => {
            if store.clear_if(&current).await {
                warn!(error = %err, "refresh: failed, ending session");
                let _ = events.send(ClientEvent::SessionExpired);
            } else {
                warn!(error = %err, "refresh: failed for a credential that was already replaced");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;

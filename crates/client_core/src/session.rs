use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use shared::auth::{LoginRequest, LoginResponse};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    config::ClientConfig,
    connection::ConnectionManager,
    credentials::{Credential, CredentialStore},
    dispatch::{EventDispatcher, SharedHandler},
    error::{GatewayError, RealtimeError},
    gateway::{endpoint_url, ApiRequest, RequestGateway},
    refresh::{HttpTokenRefresher, RefreshCoordinator, TokenRefresher},
    transport::{Connector, WebSocketConnector},
    ClientEvent,
};

/// One signed-in client session: credential, API gateway and realtime connection.
pub struct Session {
    config: ClientConfig,
    store: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    gateway: RequestGateway,
    realtime: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let http = Client::builder()
            .build()
            .context("failed to build http client")?;
        let refresh_url = endpoint_url(&config.api_base_url, &config.refresh_path)
            .with_context(|| format!("invalid refresh endpoint '{}'", config.refresh_path))?;
        let refresher = Arc::new(HttpTokenRefresher::new(http.clone(), refresh_url));
        Self::new_with_dependencies(config, http, refresher, Arc::new(WebSocketConnector))
    }

    pub fn new_with_dependencies(
        config: ClientConfig,
        http: Client,
        refresher: Arc<dyn TokenRefresher>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let store = Arc::new(CredentialStore::new());
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            refresher,
            events.clone(),
        ));
        let gateway = RequestGateway::new(
            http,
            config.api_base_url.clone(),
            config.request_timeout(),
            Arc::clone(&store),
            Arc::clone(&refresh),
        );
        let realtime = ConnectionManager::new(
            config.realtime_options()?,
            connector,
            Arc::clone(&store),
            Arc::new(EventDispatcher::new()),
            events.clone(),
        );
        Ok(Arc::new(Self {
            config,
            store,
            refresh,
            gateway,
            realtime,
            events,
        }))
    }

    /// Signs in and installs the issued credential.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), GatewayError> {
        let request = ApiRequest::post(self.config.login_path.as_str())
            .anonymous()
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })?;
        let body: LoginResponse = self.gateway.execute(request).await?.json()?;
        let expires_at = body.access_token_expires_at;
        self.store.set(Credential::from(body)).await;
        info!(username, %expires_at, "session: signed in");
        Ok(())
    }

    /// Drops the realtime connection and forgets the credential.
    pub async fn logout(&self) {
        self.realtime.disconnect();
        self.store.clear().await;
        info!("session: signed out");
    }

    pub async fn is_signed_in(&self) -> bool {
        !self.store.is_empty().await
    }

    pub async fn connect_realtime(&self) -> Result<(), RealtimeError> {
        self.realtime.connect().await
    }

    pub fn on(&self, event_type: impl Into<String>, handler: SharedHandler) -> bool {
        self.realtime.on(event_type, handler)
    }

    pub fn off(&self, event_type: &str, handler: &SharedHandler) -> bool {
        self.realtime.off(event_type, handler)
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn realtime(&self) -> &Arc<ConnectionManager> {
        &self.realtime
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

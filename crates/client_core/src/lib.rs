//! Session layer of the campus client: an authenticated HTTP gateway with
//! single-flight credential refresh, and a self-healing realtime connection.

use std::time::Duration;

pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod reconnect;
pub mod refresh;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, RealtimeOptions};
pub use credentials::{Credential, CredentialStore};
pub use dispatch::{handler_fn, EventDispatcher, EventHandler, HandlerFault, SharedHandler};
pub use error::{GatewayError, RealtimeError, RefreshError, TransportError};
pub use gateway::{ApiRequest, ApiResponse, MultipartPart, RequestBody, RequestGateway};
pub use heartbeat::HeartbeatMonitor;
pub use reconnect::ReconnectPolicy;
pub use refresh::{HttpTokenRefresher, RefreshCoordinator, TokenRefresher};
pub use session::Session;
pub use transport::{Connector, Frame, TransportLink, WebSocketConnector};

/// Session-level notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The credential could not be refreshed; the user must sign in again.
    SessionExpired,
    ConnectionStateChanged(ConnectionState),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts are exhausted; realtime stays down until `connect` is called.
    ConnectionLost,
    Error(String),
}

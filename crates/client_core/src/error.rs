use shared::error::ErrorCode;
use thiserror::Error;

/// Failure of a call issued through [`crate::gateway::RequestGateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed before a response was received: {0}")]
    Transient(String),
    #[error("authorization rejected after credential refresh")]
    AuthExpired,
    #[error("session expired: {0}")]
    SessionExpired(#[source] RefreshError),
    #[error("server returned {status} ({code:?}): {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to decode response body: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// Whether the application should treat the session as over and sign the user out.
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

/// Failure of a token refresh. Cloned to every caller waiting on the same refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh task aborted")]
    Aborted,
    #[error("credential was cleared while the refresh was in flight")]
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
    #[error("realtime handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection is closing")]
    Closing,
    #[error("connect attempt abandoned by disconnect")]
    Cancelled,
    #[error("reconnect attempts exhausted")]
    ConnectionLost,
}

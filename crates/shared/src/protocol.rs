use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved envelope types used for connection control.
pub mod control {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";

    pub const RESERVED: [&str; 4] = [PING, PONG, SUBSCRIBE, UNSUBSCRIBE];
}

/// Wire message exchanged over the realtime transport in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Builds an outbound envelope stamped with the current time and a fresh id.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            channel: None,
            payload,
            timestamp: Utc::now(),
            id: Some(Uuid::new_v4().to_string()),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn ping() -> Self {
        Self::new(control::PING, Value::Null)
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(control::SUBSCRIBE, Value::Null).with_channel(channel)
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(control::UNSUBSCRIBE, Value::Null).with_channel(channel)
    }

    pub fn is_control(&self) -> bool {
        control::RESERVED.contains(&self.kind.as_str())
    }
}

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

/// An established transport. Dropping `outbound` or sending [`Frame::Close`]
/// closes it; `inbound` ends once the transport is closed from either side.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        }
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            debug!(error = %err, "websocket send failed");
                            return;
                        }
                    }
                    Frame::Close => break,
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(Frame::Text(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(TransportLink { outbound, inbound })
    }
}

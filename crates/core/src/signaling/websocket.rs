//! WebSocket client for the signaling relay server.
//!
//! Envelopes travel as JSON text frames; the relay routes on `toId` and
//! `organizationId`, so they are never sealed on this path. Use a `wss://`
//! URL for link security.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{RelayConnector, RelaySession, SignalingError};
use crate::message::SignalEnvelope;

#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RelayConnector for WebSocketRelay {
    type Session = WebSocketSession;

    async fn connect(&self) -> Result<WebSocketSession, SignalingError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::RelayUnavailable(format!("{}: {e}", self.url)))?;
        tracing::debug!(url = %self.url, "Connected to signaling relay");
        Ok(WebSocketSession { stream })
    }
}

pub struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelaySession for WebSocketSession {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let text = serde_json::to_string(envelope)?;
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| SignalingError::RelayUnavailable(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SignalEnvelope, SignalingError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(Into::into));
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(serde_json::from_slice(&bytes).map_err(Into::into));
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Relay closed the session");
                    return None;
                }
                Ok(_) => continue,
                Err(error) => {
                    tracing::debug!(%error, "Relay stream error");
                    return None;
                }
            }
        }
    }

    async fn disconnect(mut self) {
        if let Err(error) = self.stream.close(None).await {
            tracing::trace!(%error, "Relay close handshake failed");
        }
    }
}

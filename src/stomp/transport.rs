//! Duplex Transport Layer
//!
//! Single responsibility: Open a duplex text stream and send/receive messages.
//! No knowledge of STOMP, authentication, or session management.
//!
//! The session talks to the network only through [`Connector`] and [`Duplex`], so
//! tests can swap the WebSocket for an in-memory broker.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::NotifyError;

/// One open duplex connection carrying text messages.
#[async_trait]
pub trait Duplex: Send {
    /// Send one text message.
    async fn send(&mut self, text: String) -> Result<(), NotifyError>;

    /// Receive the next text message.
    ///
    /// Returns None once the remote side has closed the stream.
    async fn recv(&mut self) -> Result<Option<String>, NotifyError>;

    /// Close the stream. Errors are swallowed; the stream is gone either way.
    async fn close(&mut self);
}

/// Factory for duplex connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Duplex>, NotifyError>;
}

/// Connects over WebSocket using tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Duplex>, NotifyError> {
        debug!(url = %endpoint, "Connecting to WebSocket");

        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| NotifyError::Connection(format!("WebSocket connect failed: {}", e)))?;

        debug!(url = %endpoint, "WebSocket connected");
        Ok(Box::new(WebSocketDuplex { ws }))
    }
}

struct WebSocketDuplex {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Duplex for WebSocketDuplex {
    async fn send(&mut self, text: String) -> Result<(), NotifyError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| NotifyError::Connection(format!("Failed to send: {}", e)))
    }

    async fn recv(&mut self) -> Result<Option<String>, NotifyError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| NotifyError::Protocol(format!("Non UTF-8 frame: {}", e)))
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Remote closed WebSocket");
                    return Ok(None);
                }
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(NotifyError::Connection(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// Extract host from URL for the STOMP `host` header
pub fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .and_then(|s| s.rsplit('@').next())
        .map(|s| s.split(':').next().unwrap_or(s))
        .filter(|s| !s.is_empty())
        .unwrap_or("localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("ws://localhost:8080/ws"), "localhost");
        assert_eq!(extract_host("wss://example.com/ws/notifications"), "example.com");
        assert_eq!(extract_host("invalid"), "localhost");
    }
}

//! WebSocket transport shared by both sides of a session.
//!
//! A [`Transport`] is a WebSocket connection split into independently owned
//! write and read halves. It is built from any `WebSocketStream`, so the
//! accepted client socket, a dialed agent socket (plain or TLS) and in-memory
//! test pairs all look the same to the rest of the relay.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::DialError;

pub(crate) type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub(crate) type WsSource = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Split WebSocket connection.
pub struct Transport {
    pub(crate) sink: WsSink,
    pub(crate) source: WsSource,
}

impl Transport {
    /// Wrap an established WebSocket stream.
    pub fn new<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        Self {
            sink: Box::pin(sink),
            source: Box::pin(source),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens agent connections. The session redials through the same dialer
/// during reconnection.
#[async_trait]
pub trait AgentDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Transport, DialError>;
}

/// Production dialer over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    connect_timeout: Duration,
}

impl WsDialer {
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl AgentDialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Transport, DialError> {
        use tungstenite::client::IntoClientRequest;

        let request = url.into_client_request().map_err(|e| DialError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let (ws_stream, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| DialError::Timeout {
                    url: url.to_string(),
                    timeout: self.connect_timeout,
                })?
                .map_err(|e| DialError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        debug!(url, status = %response.status(), "Agent WebSocket connected");
        Ok(Transport::new(ws_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_invalid_url_is_rejected() {
        let dialer = WsDialer::new(Duration::from_secs(1));
        let result = dialer.dial("not-a-url").await;
        assert!(matches!(result, Err(DialError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn dial_unreachable_host_fails() {
        let dialer = WsDialer::new(Duration::from_secs(2));
        let result = dialer.dial("ws://127.0.0.1:1/ws").await;
        assert!(matches!(
            result,
            Err(DialError::Connect { .. } | DialError::Timeout { .. })
        ));
    }
}

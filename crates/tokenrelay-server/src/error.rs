//! Relay error types.
//!
//! Boundary errors reject a connection before any session is touched.
//! Transport errors end one side of a session. Neither is ever fatal to the
//! process.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Reasons an inbound connection is refused.
#[derive(Debug, thiserror::Error)]
pub enum BoundaryError {
    #[error("missing relay token")]
    MissingToken,

    #[error("token rejected: {0}")]
    InvalidToken(String),

    #[error("unknown path: {0}")]
    UnknownPath(String),

    #[error("a client is already connected with token {token}")]
    DuplicateClient { token: String },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("agent dial failed: {0}")]
    AgentDial(#[from] DialError),
}

/// Read or write failure on one side of a session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer closed the connection (code {code:?}): {reason}")]
    PeerClosed { code: Option<u16>, reason: String },

    #[error("read error: {0}")]
    Read(String),

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("outbound queue closed")]
    QueueClosed,
}

/// Failure to open an agent connection.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid agent URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connect to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Outcome of a reconnection run that did not restore the agent.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("agent reconnection exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("session cancelled during reconnection")]
    Cancelled,
}

//! Shared test helpers for endpoint and session tests.
//!
//! WebSocket pairs run over `tokio::io::duplex`, so the real tungstenite
//! codec is exercised without sockets.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::endpoint::{Endpoint, EndpointRole, EndpointSettings};
use crate::error::DialError;
use crate::hub::RelayHub;
use crate::reconnect::{ReconnectPolicy, SessionSettings};
use crate::session::RelaySession;
use crate::transport::{AgentDialer, Transport};

/// The far side of an in-memory connection.
pub type Peer = WebSocketStream<DuplexStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const AGENT_URL: &str = "ws://agent.test/api/ws/stream";

/// Build a transport for the relay and the peer talking to it. `relay_role`
/// is the WebSocket role the relay plays on this connection.
pub async fn duplex_pair(relay_role: Role) -> (Transport, Peer) {
    let peer_role = match relay_role {
        Role::Server => Role::Client,
        Role::Client => Role::Server,
    };
    let (relay_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (relay_ws, peer_ws) = tokio::join!(
        WebSocketStream::from_raw_socket(relay_io, relay_role, None),
        WebSocketStream::from_raw_socket(peer_io, peer_role, None),
    );
    (Transport::new(relay_ws), peer_ws)
}

pub fn test_endpoint_settings() -> EndpointSettings {
    EndpointSettings {
        queue_capacity: 1000,
        keepalive_interval: Duration::from_secs(30),
        read_deadline: Duration::from_secs(60),
        close_timeout: Duration::from_secs(1),
    }
}

pub fn test_session_settings() -> SessionSettings {
    SessionSettings {
        endpoint: test_endpoint_settings(),
        reconnect: ReconnectPolicy {
            base_interval: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        },
        exit_grace: Duration::from_millis(20),
    }
}

/// Next text frame from `peer`, skipping control frames.
pub async fn recv_text(peer: &mut Peer) -> String {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, peer.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match frame {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next text frame parsed as JSON.
pub async fn recv_json(peer: &mut Peer) -> Value {
    let text = recv_text(peer).await;
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("not JSON ({e}): {text}"))
}

/// Read until the stream ends and count Close frames seen.
pub async fn count_close_frames(peer: &mut Peer) -> usize {
    let mut closes = 0;
    while let Ok(Some(frame)) = tokio::time::timeout(DRAIN_TIMEOUT, peer.next()).await {
        match frame {
            Ok(Message::Close(_)) => closes += 1,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    closes
}

/// Dialer that replays a fixed script of outcomes. Successful dials hand the
/// agent-side peer to the test through a channel. Once the script runs out
/// every dial fails.
pub struct ScriptedDialer {
    script: Mutex<VecDeque<bool>>,
    peers: mpsc::UnboundedSender<Peer>,
    attempts: AtomicU32,
}

impl ScriptedDialer {
    pub fn new(script: impl IntoIterator<Item = bool>) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            peers,
            attempts: AtomicU32::new(0),
        });
        (dialer, rx)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentDialer for ScriptedDialer {
    async fn dial(&self, url: &str) -> Result<Transport, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let succeed = self.script.lock().await.pop_front().unwrap_or(false);
        if !succeed {
            return Err(DialError::Connect {
                url: url.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let (transport, peer) = duplex_pair(Role::Client).await;
        let _ = self.peers.send(peer);
        Ok(transport)
    }
}

/// A running session with both peers exposed.
pub struct Established {
    pub hub: Arc<RelayHub>,
    pub session: Arc<RelaySession>,
    pub client: Peer,
    pub agent: Peer,
}

/// Wire a session for `token` the way the connection handler does, with
/// in-memory client and agent peers.
pub async fn establish(hub: Arc<RelayHub>, token: &str) -> Established {
    let settings = hub.settings().endpoint.clone();
    let session = hub.get_or_create(token).await;

    let (client_transport, client) = duplex_pair(Role::Server).await;
    let (client_ep, client_reader) =
        Endpoint::spawn(EndpointRole::Client, token, client_transport, &settings);
    session.bind_client(client_ep).await.unwrap();

    let (agent_transport, agent) = duplex_pair(Role::Client).await;
    let (agent_ep, agent_reader) =
        Endpoint::spawn(EndpointRole::Agent, token, agent_transport, &settings);
    session
        .start(AGENT_URL.to_string(), agent_ep, client_reader, agent_reader)
        .await;

    Established {
        hub,
        session,
        client,
        agent,
    }
}

/// Poll `cond` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

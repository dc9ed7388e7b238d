//! One side of a relay session.
//!
//! An [`Endpoint`] owns the write half of a [`Transport`] through a bounded
//! outbound queue drained by a single writer task, so frames reach the wire
//! in enqueue order and nothing else ever writes to the socket. The read
//! half is handed out once as an [`EndpointReader`] to the forwarding loop
//! that consumes it.
//!
//! Closing an endpoint is the only shutdown signal: the writer flushes what
//! is already queued, sends a Close frame and exits, and a blocked reader
//! returns `Ok(None)`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use tokenrelay_core::config::SessionConfig;

use crate::error::TransportError;
use crate::transport::{Transport, WsSink, WsSource};

/// Payload of transport-level keepalive pings.
const KEEPALIVE_PAYLOAD: &[u8] = b"ping";

/// Which side of the session an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// The browser-facing connection accepted by the relay.
    Client,
    /// The connection the relay dialed to the agent.
    Agent,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// Per-endpoint tuning.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub queue_capacity: usize,
    /// Period of the writer's Ping frames.
    pub keepalive_interval: Duration,
    /// Maximum wait for any inbound frame.
    pub read_deadline: Duration,
    /// Bound on the final flush + Close frame.
    pub close_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for EndpointSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            keepalive_interval: config.keepalive_interval(),
            read_deadline: config.read_deadline(),
            close_timeout: config.close_timeout(),
        }
    }
}

/// Write side of one relayed connection.
pub struct Endpoint {
    role: EndpointRole,
    token: String,
    outbound: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Wrap `transport`, spawn its writer task and return the endpoint with
    /// its reader.
    pub fn spawn(
        role: EndpointRole,
        token: &str,
        transport: Transport,
        settings: &EndpointSettings,
    ) -> (Arc<Self>, EndpointReader) {
        let (outbound, queue) = mpsc::channel(settings.queue_capacity.max(1));
        let (shutdown, writer_shutdown) = watch::channel(false);
        let reader_shutdown = shutdown.subscribe();

        let writer = Writer {
            role,
            token: token.to_string(),
            sink: transport.sink,
            queue,
            shutdown: writer_shutdown,
            keepalive_interval: settings.keepalive_interval,
            close_timeout: settings.close_timeout,
        };
        tokio::spawn(writer.run());

        let endpoint = Arc::new(Self {
            role,
            token: token.to_string(),
            outbound,
            shutdown,
            closed: AtomicBool::new(false),
        });
        let reader = EndpointReader {
            role,
            source: transport.source,
            shutdown: reader_shutdown,
            read_deadline: settings.read_deadline,
        };
        (endpoint, reader)
    }

    pub const fn role(&self) -> EndpointRole {
        self.role
    }

    /// Queue a text frame. Waits for capacity when the queue is full.
    pub async fn enqueue(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::QueueClosed);
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::QueueClosed)
    }

    /// Close the endpoint. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        debug!(token = %self.token, role = %self.role, "Endpoint closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Resolves once `shutdown` flips to `true` or its sender is gone.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

struct Writer {
    role: EndpointRole,
    token: String,
    sink: WsSink,
    queue: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
    keepalive_interval: Duration,
    close_timeout: Duration,
}

impl Writer {
    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                biased;
                () = closed(&mut self.shutdown) => break,
                next = self.queue.recv() => {
                    let Some(text) = next else { break };
                    if !self.write(Message::Text(text)).await {
                        return;
                    }
                }
                // Outbound traffic says nothing about whether the peer is
                // still reading, so ping on every tick. The Pong is what
                // keeps a receive-only peer inside its read deadline.
                _ = keepalive.tick() => {
                    trace!(token = %self.token, role = %self.role, "Sending keepalive ping");
                    if !self.write(Message::Ping(KEEPALIVE_PAYLOAD.to_vec())).await {
                        return;
                    }
                }
            }
        }

        let close_timeout = self.close_timeout;
        if tokio::time::timeout(close_timeout, self.finish()).await.is_err() {
            warn!(token = %self.token, role = %self.role, "Timed out closing transport");
        }
    }

    /// Write one frame unless the endpoint is closed first. Returns `false`
    /// when the writer must stop without a close handshake.
    async fn write(&mut self, message: Message) -> bool {
        let result = tokio::select! {
            biased;
            result = self.sink.send(message) => result,
            () = closed(&mut self.shutdown) => return true,
        };
        if let Err(e) = result {
            info!(token = %self.token, role = %self.role, error = %e, "Write failed");
            self.queue.close();
            return false;
        }
        true
    }

    /// Flush frames that were queued before the close, then send one Close
    /// frame and close the sink.
    async fn finish(&mut self) {
        self.queue.close();
        while let Some(text) = self.queue.recv().await {
            if self.sink.feed(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Read side of one relayed connection.
pub struct EndpointReader {
    role: EndpointRole,
    source: WsSource,
    shutdown: watch::Receiver<bool>,
    read_deadline: Duration,
}

impl fmt::Debug for EndpointReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointReader")
            .field("role", &self.role)
            .field("read_deadline", &self.read_deadline)
            .finish_non_exhaustive()
    }
}

impl EndpointReader {
    /// Next text frame from the peer.
    ///
    /// Returns `Ok(None)` once the owning [`Endpoint`] is closed. Control
    /// frames and binary frames are consumed here; each read is bounded by
    /// the read deadline, so a Pong answering our keepalive keeps the side
    /// alive.
    pub async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        let deadline = self.read_deadline;
        loop {
            let frame = tokio::select! {
                biased;
                () = closed(&mut self.shutdown) => return Ok(None),
                frame = tokio::time::timeout(deadline, self.source.next()) => frame,
            };

            let message = match frame {
                Err(_) => return Err(TransportError::ReadTimeout(deadline)),
                Ok(None) => {
                    return Err(TransportError::PeerClosed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                }
                Ok(Some(Err(e))) => return Err(TransportError::Read(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => return Ok(Some(text)),
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (Some(u16::from(cf.code)), cf.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return Err(TransportError::PeerClosed { code, reason });
                }
                Message::Pong(_) => trace!(role = %self.role, "Keepalive pong"),
                // Answered by tungstenite on the next flush.
                Message::Ping(_) => trace!(role = %self.role, "Peer ping"),
                Message::Binary(data) => {
                    debug!(role = %self.role, len = data.len(), "Ignoring binary frame");
                }
                Message::Frame(_) => {}
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;
    use crate::test_helpers::{count_close_frames, duplex_pair, recv_text, test_endpoint_settings};

    #[tokio::test]
    async fn writes_preserve_enqueue_order() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let (endpoint, _reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &test_endpoint_settings());

        for i in 0..100 {
            endpoint.enqueue(format!("m{i}")).await.unwrap();
        }
        for i in 0..100 {
            assert_eq!(recv_text(&mut peer).await, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn close_flushes_queue_then_sends_one_close_frame() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let (endpoint, reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &test_endpoint_settings());

        endpoint.enqueue("last words".into()).await.unwrap();
        assert!(endpoint.close());
        assert!(!endpoint.close());
        drop(reader);

        assert_eq!(recv_text(&mut peer).await, "last words");
        assert_eq!(count_close_frames(&mut peer).await, 1);
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let (transport, _peer) = duplex_pair(Role::Server).await;
        let (endpoint, _reader) =
            Endpoint::spawn(EndpointRole::Agent, "t", transport, &test_endpoint_settings());
        endpoint.close();
        assert!(matches!(
            endpoint.enqueue("x".into()).await,
            Err(TransportError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn reader_returns_none_after_local_close() {
        let (transport, _peer) = duplex_pair(Role::Server).await;
        let (endpoint, mut reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &test_endpoint_settings());

        let pending = tokio::spawn(async move { reader.next_text().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint.close();

        assert!(matches!(pending.await.unwrap(), Ok(None)));
    }

    #[tokio::test]
    async fn reader_reports_peer_close() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let (_endpoint, mut reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &test_endpoint_settings());

        peer.close(None).await.unwrap();
        assert!(matches!(
            reader.next_text().await,
            Err(TransportError::PeerClosed { .. })
        ));
    }

    #[tokio::test]
    async fn reader_skips_binary_frames() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let (_endpoint, mut reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &test_endpoint_settings());

        peer.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        peer.send(Message::Text("after".into())).await.unwrap();
        assert_eq!(reader.next_text().await.unwrap().as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn reader_times_out_on_silence() {
        let (transport, _peer) = duplex_pair(Role::Server).await;
        let settings = EndpointSettings {
            read_deadline: Duration::from_millis(50),
            ..test_endpoint_settings()
        };
        let (_endpoint, mut reader) =
            Endpoint::spawn(EndpointRole::Agent, "t", transport, &settings);

        assert!(matches!(
            reader.next_text().await,
            Err(TransportError::ReadTimeout(_))
        ));
    }

    #[tokio::test]
    async fn idle_writer_sends_keepalive_ping() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let settings = EndpointSettings {
            keepalive_interval: Duration::from_millis(30),
            ..test_endpoint_settings()
        };
        let (_endpoint, _reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &settings);

        let frame = tokio::time::timeout(Duration::from_secs(2), peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Message::Ping(KEEPALIVE_PAYLOAD.to_vec()));
    }

    #[tokio::test]
    async fn busy_writer_still_pings_and_pong_keeps_reader_alive() {
        let (transport, mut peer) = duplex_pair(Role::Server).await;
        let settings = EndpointSettings {
            keepalive_interval: Duration::from_millis(30),
            read_deadline: Duration::from_millis(90),
            ..test_endpoint_settings()
        };
        let (endpoint, mut reader) =
            Endpoint::spawn(EndpointRole::Client, "t", transport, &settings);

        // The reader only ever sees Pongs; it must not time out.
        let reading = tokio::spawn(async move { reader.next_text().await });

        let mut pings = 0;
        for i in 0..30 {
            endpoint.enqueue(format!("m{i}")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            // Reading lets the peer flush its automatic Pong replies.
            while let Ok(Some(Ok(frame))) =
                tokio::time::timeout(Duration::from_millis(1), peer.next()).await
            {
                if matches!(frame, Message::Ping(_)) {
                    pings += 1;
                }
            }
        }

        assert!(pings >= 3, "expected pings while writing, saw {pings}");
        assert!(!reading.is_finished());
        endpoint.close();
        assert!(matches!(reading.await.unwrap(), Ok(None)));
    }
}

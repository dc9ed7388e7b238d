//! Relay session: one browser client paired with one agent connection.
//!
//! A session runs two forwarding loops. The client loop answers keepalive
//! and local actions itself and forwards everything else to the agent. The
//! agent loop forwards to the client and, when the agent side drops, redials
//! with backoff while the client stays connected. Either loop can end the
//! session; [`RelaySession::cleanup`] is latched so teardown happens once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

use tokenrelay_core::envelope::{self, Envelope, Inbound, action};

use crate::endpoint::{Endpoint, EndpointReader, EndpointRole};
use crate::error::{BoundaryError, ReconnectError};
use crate::hub::RelayHub;
use crate::metrics;
use crate::reconnect::{LinkState, SessionSettings};
use crate::transport::AgentDialer;

struct AgentLink {
    endpoint: Option<Arc<Endpoint>>,
    state: LinkState,
}

/// A token-addressed pairing of client and agent.
pub struct RelaySession {
    token: String,
    hub: Weak<RelayHub>,
    dialer: Arc<dyn AgentDialer>,
    settings: Arc<SessionSettings>,
    agent_url: OnceLock<String>,
    client: Mutex<Option<Arc<Endpoint>>>,
    agent: Mutex<AgentLink>,
    cancel: watch::Sender<bool>,
    retries: AtomicU32,
    cleaned_up: AtomicBool,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("token", &self.token)
            .field("retries", &self.retry_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Resolves once the session is cancelled.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

impl RelaySession {
    pub(crate) fn new(
        token: String,
        hub: Weak<RelayHub>,
        dialer: Arc<dyn AgentDialer>,
        settings: Arc<SessionSettings>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            token,
            hub,
            dialer,
            settings,
            agent_url: OnceLock::new(),
            client: Mutex::new(None),
            agent: Mutex::new(AgentLink {
                endpoint: None,
                state: LinkState::Connected,
            }),
            cancel,
            retries: AtomicU32::new(0),
            cleaned_up: AtomicBool::new(false),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn has_client(&self) -> bool {
        self.client.lock().await.is_some()
    }

    pub async fn link_state(&self) -> LinkState {
        self.agent.lock().await.state
    }

    /// Dial attempts made in the current reconnection run; zero while the
    /// agent is connected.
    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.cleaned_up.load(Ordering::Acquire)
    }

    /// Attach the client endpoint. Fails if a client is already bound or the
    /// session has been cleaned up.
    pub async fn bind_client(&self, endpoint: Arc<Endpoint>) -> Result<(), BoundaryError> {
        let mut client = self.client.lock().await;
        if client.is_some() || self.is_closed() {
            return Err(BoundaryError::DuplicateClient {
                token: self.token.clone(),
            });
        }
        *client = Some(endpoint);
        Ok(())
    }

    /// Attach the first agent endpoint and start both forwarding loops.
    pub async fn start(
        self: &Arc<Self>,
        agent_url: String,
        agent: Arc<Endpoint>,
        client_reader: EndpointReader,
        agent_reader: EndpointReader,
    ) {
        let _ = self.agent_url.set(agent_url);
        {
            let mut link = self.agent.lock().await;
            if self.is_closed() {
                agent.close();
                return;
            }
            link.endpoint = Some(agent);
            link.state = LinkState::Connected;
        }

        metrics::session_opened();
        info!(token = %self.token, "Session started");
        tokio::spawn(Arc::clone(self).run_client_loop(client_reader));
        tokio::spawn(Arc::clone(self).run_agent_loop(agent_reader));
    }

    async fn run_client_loop(self: Arc<Self>, mut reader: EndpointReader) {
        loop {
            match reader.next_text().await {
                Ok(Some(text)) => self.handle_client_text(text).await,
                Ok(None) => break,
                Err(e) => {
                    info!(token = %self.token, error = %e, "Client disconnected");
                    break;
                }
            }
        }
        self.cleanup().await;
    }

    async fn handle_client_text(&self, text: String) {
        match envelope::classify(&text) {
            Ok(Inbound::Ping { reply }) => self.send_to_client(reply).await,
            Ok(Inbound::Pong) => trace!(token = %self.token, "Client pong"),
            Ok(Inbound::Local(request)) => {
                match Envelope::local_response(&request).to_json() {
                    Ok(json) => self.send_to_client(json).await,
                    Err(e) => warn!(token = %self.token, error = %e, "Failed to encode local response"),
                }
            }
            Ok(Inbound::Message(message)) => self.forward_to_agent(text, message.request_id).await,
            Err(e) => warn!(token = %self.token, error = %e, "Dropping malformed client message"),
        }
    }

    /// Forward a client frame unchanged. When no agent is attached the frame
    /// is dropped and the client told so.
    async fn forward_to_agent(&self, text: String, request_id: Option<Value>) {
        let target = {
            let link = self.agent.lock().await;
            match (&link.endpoint, link.state) {
                (Some(endpoint), LinkState::Connected) => Some(Arc::clone(endpoint)),
                _ => None,
            }
        };

        let delivered = match target {
            Some(endpoint) => endpoint.enqueue(text).await.is_ok(),
            None => false,
        };
        if delivered {
            metrics::message_forwarded();
            return;
        }

        debug!(token = %self.token, "No agent attached, dropping client message");
        let notice = Envelope::notify(
            action::AGENT_UNAVAILABLE,
            "Agent connection unavailable, message dropped",
        )
        .with_request_id(request_id);
        self.send_envelope(&notice).await;
    }

    async fn run_agent_loop(self: Arc<Self>, mut reader: EndpointReader) {
        loop {
            let lost = match reader.next_text().await {
                Ok(Some(text)) => {
                    self.handle_agent_text(text).await;
                    continue;
                }
                Ok(None) => "agent endpoint closed".to_string(),
                Err(e) => e.to_string(),
            };
            if self.is_closed() {
                break;
            }

            warn!(token = %self.token, reason = %lost, "Agent connection lost");
            match self.reconnect_agent().await {
                Ok(next) => reader = next,
                Err(ReconnectError::Cancelled) => break,
                Err(e @ ReconnectError::Exhausted { .. }) => {
                    metrics::reconnect_exhausted();
                    warn!(token = %self.token, error = %e, "Closing session");
                    self.fail("Agent connection could not be restored").await;
                    break;
                }
            }
        }
        debug!(token = %self.token, "Agent loop finished");
    }

    /// Agent payloads are opaque: only keepalive is intercepted.
    async fn handle_agent_text(&self, text: String) {
        match envelope::keepalive(&text) {
            Some(Inbound::Ping { reply }) => self.send_to_agent(reply).await,
            Some(Inbound::Pong) => trace!(token = %self.token, "Agent pong"),
            Some(Inbound::Local(_) | Inbound::Message(_)) | None => {
                self.send_to_client(text).await;
                metrics::message_forwarded();
            }
        }
    }

    /// Replace a lost agent endpoint. The client gets exactly one
    /// `reconnecting` notification per run and `reconnect_success` on success.
    async fn reconnect_agent(&self) -> Result<EndpointReader, ReconnectError> {
        {
            let mut link = self.agent.lock().await;
            if self.is_closed() {
                return Err(ReconnectError::Cancelled);
            }
            link.state = LinkState::Reconnecting;
            if let Some(old) = link.endpoint.take() {
                old.close();
            }
        }
        self.notify_client(action::RECONNECTING, "Agent connection lost, reconnecting")
            .await;

        let Some(url) = self.agent_url.get().cloned() else {
            return Err(ReconnectError::Exhausted { attempts: 0 });
        };
        let policy = &self.settings.reconnect;
        let mut cancel = self.cancel.subscribe();

        let mut attempt = 1;
        while policy.should_retry(attempt) {
            self.retries.store(attempt, Ordering::Release);
            let delay = policy.delay_for_attempt(attempt);
            info!(
                token = %self.token,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Redialing agent"
            );

            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => return Err(ReconnectError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            metrics::reconnect_attempt();
            let dialed = tokio::select! {
                biased;
                () = cancelled(&mut cancel) => return Err(ReconnectError::Cancelled),
                dialed = self.dialer.dial(&url) => dialed,
            };

            match dialed {
                Ok(transport) => {
                    let (endpoint, reader) = Endpoint::spawn(
                        EndpointRole::Agent,
                        &self.token,
                        transport,
                        &self.settings.endpoint,
                    );
                    {
                        let mut link = self.agent.lock().await;
                        if self.is_closed() {
                            endpoint.close();
                            return Err(ReconnectError::Cancelled);
                        }
                        link.endpoint = Some(endpoint);
                        link.state = LinkState::Connected;
                    }
                    self.retries.store(0, Ordering::Release);
                    info!(token = %self.token, attempt, "Agent reconnected");
                    self.notify_client(action::RECONNECT_SUCCESS, "Agent connection restored")
                        .await;
                    return Ok(reader);
                }
                Err(e) => warn!(token = %self.token, attempt, error = %e, "Agent redial failed"),
            }
            attempt += 1;
        }

        Err(ReconnectError::Exhausted {
            attempts: policy.max_retries,
        })
    }

    /// Give up on the session: mark the agent link failed, send `exit` to the
    /// client, wait the exit grace period, then clean up.
    pub async fn fail(&self, reason: &str) {
        self.agent.lock().await.state = LinkState::Failed;
        self.notify_client(action::EXIT, reason).await;

        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            biased;
            () = cancelled(&mut cancel) => {}
            () = tokio::time::sleep(self.settings.exit_grace) => {}
        }
        self.cleanup().await;
    }

    /// Tear the session down. Only the first call does anything: it stops
    /// any reconnection run, closes both endpoints and leaves the hub.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.send_replace(true);

        let client = self.client.lock().await.take();
        let agent = self.agent.lock().await.endpoint.take();
        if let Some(client) = client {
            client.close();
        }
        if let Some(agent) = agent {
            agent.close();
        }

        if let Some(hub) = self.hub.upgrade() {
            hub.remove_session(self).await;
        }
        metrics::session_closed();
        info!(token = %self.token, "Session cleaned up");
    }

    async fn notify_client(&self, name: &str, data: &str) {
        self.send_envelope(&Envelope::notify(name, data)).await;
    }

    async fn send_envelope(&self, message: &Envelope) {
        match message.to_json() {
            Ok(json) => self.send_to_client(json).await,
            Err(e) => warn!(token = %self.token, error = %e, "Failed to encode notification"),
        }
    }

    async fn send_to_client(&self, text: String) {
        let client = self.client.lock().await.clone();
        let Some(client) = client else {
            debug!(token = %self.token, "No client attached, dropping frame");
            return;
        };
        if let Err(e) = client.enqueue(text).await {
            debug!(token = %self.token, error = %e, "Client send failed");
        }
    }

    async fn send_to_agent(&self, text: String) {
        let agent = self.agent.lock().await.endpoint.clone();
        let Some(agent) = agent else {
            return;
        };
        if let Err(e) = agent.enqueue(text).await {
            debug!(token = %self.token, error = %e, "Agent send failed");
        }
    }
}

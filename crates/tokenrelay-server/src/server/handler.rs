//! Per-connection upgrade handling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tracing::{info, instrument, warn};

use crate::endpoint::{Endpoint, EndpointRole};
use crate::error::BoundaryError;
use crate::hub::RelayHub;
use crate::server::token::{TokenSource, TokenValidator, extract_token};
use crate::transport::Transport;

/// Text sent to a client that connects with a token already in use.
pub const DUPLICATE_CLIENT_MESSAGE: &str = "Another client is already connected with this token";

/// Turns accepted sockets into running relay sessions.
pub struct ConnectionHandler {
    hub: Arc<RelayHub>,
    validator: Arc<dyn TokenValidator>,
    agent_url: String,
    path: String,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("agent_url", &self.agent_url)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandler {
    pub fn new(
        hub: Arc<RelayHub>,
        validator: Arc<dyn TokenValidator>,
        agent_url: String,
        path: String,
    ) -> Self {
        Self {
            hub,
            validator,
            agent_url,
            path,
        }
    }

    pub const fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Run the upgrade handshake, bind the client to its session and dial
    /// the agent. Returns once the session's loops are running.
    #[instrument(skip(self, stream), fields(conn_id = %uuid::Uuid::new_v4()))]
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr) -> Result<(), BoundaryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut decision: Option<Result<String, BoundaryError>> = None;
        let callback = |request: &Request, mut response: Response| match self.authorize(request) {
            Ok((token, source)) => {
                if source == TokenSource::Subprotocol
                    && let Ok(value) = HeaderValue::from_str(&token)
                {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                decision = Some(Ok(token));
                Ok(response)
            }
            Err(e) => {
                let rejection = error_response(&e);
                decision = Some(Err(e));
                Err(rejection)
            }
        };

        let handshake = accept_hdr_async(stream, callback).await;
        let (ws_stream, token) = match (handshake, decision) {
            (Ok(ws_stream), Some(Ok(token))) => (ws_stream, token),
            (Ok(_), _) => return Err(BoundaryError::MissingToken),
            (Err(_), Some(Err(rejection))) => {
                warn!(error = %rejection, "Rejected upgrade");
                return Err(rejection);
            }
            (Err(e), _) => return Err(BoundaryError::Handshake(e)),
        };

        let settings = self.hub.settings().endpoint.clone();
        let (client, client_reader) =
            Endpoint::spawn(EndpointRole::Client, &token, Transport::new(ws_stream), &settings);

        let session = self.hub.get_or_create(&token).await;
        if let Err(e) = session.bind_client(Arc::clone(&client)).await {
            warn!(token, "Rejecting second client for token");
            let _ = client.enqueue(DUPLICATE_CLIENT_MESSAGE.to_string()).await;
            client.close();
            return Err(e);
        }
        info!(token, "Client connected");

        let transport = match self.hub.dialer().dial(&self.agent_url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(token, error = %e, "Agent dial failed");
                session.fail("Failed to connect to agent").await;
                return Err(BoundaryError::AgentDial(e));
            }
        };
        let (agent, agent_reader) =
            Endpoint::spawn(EndpointRole::Agent, &token, transport, &settings);

        session
            .start(self.agent_url.clone(), agent, client_reader, agent_reader)
            .await;
        Ok(())
    }

    fn authorize(&self, request: &Request) -> Result<(String, TokenSource), BoundaryError> {
        let path = request.uri().path();
        if path != self.path {
            return Err(BoundaryError::UnknownPath(path.to_string()));
        }
        let (token, source) = extract_token(request).ok_or(BoundaryError::MissingToken)?;
        self.validator
            .validate(&token)
            .map_err(BoundaryError::InvalidToken)?;
        Ok((token, source))
    }
}

fn error_response(error: &BoundaryError) -> ErrorResponse {
    let status = match error {
        BoundaryError::UnknownPath(_) => StatusCode::NOT_FOUND,
        BoundaryError::MissingToken => StatusCode::BAD_REQUEST,
        BoundaryError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}

//! Relay token extraction and validation.
//!
//! Browsers cannot set arbitrary headers on a WebSocket upgrade, so the token
//! is accepted from three places, in order: the first `Sec-WebSocket-Protocol`
//! value, an `X-Relay-Token` header, or a `token` query parameter.

use std::collections::HashSet;

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

pub const TOKEN_HEADER: &str = "x-relay-token";
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Where a token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// First `Sec-WebSocket-Protocol` value; must be echoed in the response.
    Subprotocol,
    Header,
    Query,
}

/// Decides whether a token may open a session.
pub trait TokenValidator: Send + Sync {
    /// `Err` carries the reason shown in the rejection.
    fn validate(&self, token: &str) -> Result<(), String>;
}

/// Accepts every non-empty token. Used when no allow list is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyToken;

impl TokenValidator for AcceptAnyToken {
    fn validate(&self, _token: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Accepts only configured tokens.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    tokens: HashSet<String>,
}

impl AllowList {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl TokenValidator for AllowList {
    fn validate(&self, token: &str) -> Result<(), String> {
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err("token is not in the allow list".to_string())
        }
    }
}

/// Find the relay token on an upgrade request.
pub fn extract_token(request: &Request) -> Option<(String, TokenSource)> {
    let headers = request.headers();

    let subprotocol = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = subprotocol {
        return Some((token.to_string(), TokenSource::Subprotocol));
    }

    let header = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = header {
        return Some((token.to_string(), TokenSource::Header));
    }

    request
        .uri()
        .query()
        .and_then(|query| {
            query.split('&').find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                (key == TOKEN_QUERY_PARAM && !value.is_empty()).then_some(value)
            })
        })
        .map(|token| (token.to_string(), TokenSource::Query))
}

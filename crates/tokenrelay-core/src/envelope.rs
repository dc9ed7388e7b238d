//! Wire envelope exchanged between browsers, the relay and agents.
//!
//! Every application frame is a JSON object:
//!
//! ```json
//! {"type":"request","request_id":"r1","action":"download","data":{},"timestamp":1700000000}
//! ```
//!
//! Older browser builds send the compact keys `t`, `r`, `a` and `d`; those
//! are accepted on input. Keepalive may also arrive as the bare text
//! literals `ping` / `pong` outside any envelope.
//!
//! The relay only parses frames to classify them. Forwarded frames are
//! always relayed as the original text. Parsing is lenient: unknown `type`
//! values, non-string correlation ids and free-form timestamps all pass.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Bare keepalive request.
pub const PING_LITERAL: &str = "ping";
/// Bare keepalive answer.
pub const PONG_LITERAL: &str = "pong";

/// Action names with meaning to the relay itself.
pub mod action {
    /// Handled inside the relay, never reaches the agent.
    pub const LOCAL: &str = "local";
    /// The agent link dropped and is being redialed.
    pub const RECONNECTING: &str = "reconnecting";
    /// A redial succeeded.
    pub const RECONNECT_SUCCESS: &str = "reconnect_success";
    /// The session is being torn down.
    pub const EXIT: &str = "exit";
    /// A client message was dropped because no agent was attached.
    pub const AGENT_UNAVAILABLE: &str = "agent_unavailable";
}

/// Envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notify,
    Ping,
    Pong,
    Local,
    Remote,
    /// Any type the relay has no opinion on.
    #[serde(other)]
    Other,
}

/// A parsed application frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", alias = "t")]
    pub kind: MessageType,

    /// Correlation id, echoed as-is. Usually a string, but any JSON value is
    /// accepted.
    #[serde(default, alias = "r", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,

    #[serde(default, alias = "a", skip_serializing_if = "String::is_empty")]
    pub action: String,

    #[serde(default, alias = "d", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Unix seconds on frames the relay builds; passed through untouched
    /// otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// How a reader should treat an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Keepalive request. `reply` goes back to the sender in the same form.
    Ping { reply: String },
    /// Keepalive answer. Nothing to do beyond having read it.
    Pong,
    /// A local action; answered by the relay.
    Local(Envelope),
    /// Anything else; forwarded verbatim.
    Message(Envelope),
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: MessageType, action: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind,
            request_id: None,
            action: action.into(),
            data,
            timestamp: Some(Value::from(unix_now())),
        }
    }

    /// A relay-originated notification, e.g. `reconnecting`.
    pub fn notify(action: &str, data: impl Into<String>) -> Self {
        Self::new(MessageType::Notify, action, Some(Value::String(data.into())))
    }

    /// Envelope-form answer to an envelope-form ping.
    pub fn pong(request_id: Option<Value>) -> Self {
        Self {
            request_id,
            ..Self::new(MessageType::Pong, "", None)
        }
    }

    /// Synthetic response to a local action. The request data is embedded in
    /// the response text.
    pub fn local_response(request: &Self) -> Self {
        let shown = match &request.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        Self {
            request_id: request.request_id.clone(),
            ..Self::new(
                MessageType::Response,
                action::LOCAL,
                Some(Value::String(format!(
                    "Local processing result for data: {shown}"
                ))),
            )
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<Value>) -> Self {
        self.request_id = request_id;
        self
    }

    pub const fn is_local(&self) -> bool {
        matches!(self.kind, MessageType::Local)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Classify a text frame.
///
/// Bare `ping`/`pong` literals are recognised after trimming whitespace.
/// Everything else must parse as an [`Envelope`]; otherwise
/// [`Error::Protocol`] is returned and the caller drops the frame.
pub fn classify(text: &str) -> Result<Inbound> {
    match text.trim() {
        PING_LITERAL => {
            return Ok(Inbound::Ping {
                reply: PONG_LITERAL.to_string(),
            });
        }
        PONG_LITERAL => return Ok(Inbound::Pong),
        _ => {}
    }

    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))?;

    Ok(match envelope.kind {
        MessageType::Ping => Inbound::Ping {
            reply: Envelope::pong(envelope.request_id).to_json()?,
        },
        MessageType::Pong => Inbound::Pong,
        _ if envelope.is_local() || envelope.action == action::LOCAL => Inbound::Local(envelope),
        _ => Inbound::Message(envelope),
    })
}

/// Recognise keepalive in a frame that is otherwise opaque.
///
/// Returns the same `Ping`/`Pong` classification as [`classify`] for bare
/// literals and for JSON objects whose `type` (or `t`) is `ping`/`pong`,
/// and `None` for everything else, including text that is not JSON at all.
/// Agent frames go through this instead of [`classify`] so that anything
/// that is not keepalive reaches the client unchanged.
pub fn keepalive(text: &str) -> Option<Inbound> {
    match text.trim() {
        PING_LITERAL => {
            return Some(Inbound::Ping {
                reply: PONG_LITERAL.to_string(),
            });
        }
        PONG_LITERAL => return Some(Inbound::Pong),
        _ => {}
    }

    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text) else {
        return None;
    };
    let kind = object.get("type").or_else(|| object.get("t"))?.as_str()?;
    match kind {
        "ping" => {
            let request_id = object.get("request_id").or_else(|| object.get("r")).cloned();
            let reply = Envelope::pong(request_id).to_json().ok()?;
            Some(Inbound::Ping { reply })
        }
        "pong" => Some(Inbound::Pong),
        _ => None,
    }
}

/// Seconds since the unix epoch, saturating.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

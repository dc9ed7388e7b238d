//! tokenrelay Server Library
//!
//! Core functionality for the relay:
//! - Endpoints wrapping one WebSocket side with an outbound queue and writer task
//! - Relay sessions pairing a browser client with a dialed-out agent
//! - Agent reconnection with exponential backoff
//! - Token-keyed hub of live sessions
//! - Inbound connection handling and the TCP accept loop

pub mod endpoint;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use endpoint::{Endpoint, EndpointReader, EndpointRole, EndpointSettings};
pub use error::{BoundaryError, DialError, ReconnectError, TransportError};
pub use hub::RelayHub;
pub use reconnect::{LinkState, ReconnectPolicy, SessionSettings};
pub use server::{AcceptAnyToken, AllowList, ConnectionHandler, RelayServer, TokenValidator};
pub use session::RelaySession;
pub use transport::{AgentDialer, Transport, WsDialer};

//! WebSocket front end: upgrade handling and the TCP accept loop.

pub mod handler;
pub mod listener;
pub mod token;

pub use handler::{ConnectionHandler, DUPLICATE_CLIENT_MESSAGE};
pub use listener::RelayServer;
pub use token::{AcceptAnyToken, AllowList, TokenSource, TokenValidator};

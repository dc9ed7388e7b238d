//! `tokenrelay` Core Library
//!
//! Shared functionality for `tokenrelay` components:
//! - Wire envelope parsing and keepalive/local-action classification
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod envelope;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::Config;
pub use envelope::{Envelope, Inbound, MessageType};
pub use error::{Error, Result};

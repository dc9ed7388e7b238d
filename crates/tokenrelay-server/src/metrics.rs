//! Relay counters.
//!
//! Thin wrappers over the shared `OpenTelemetry` meters. Without the
//! `metrics` feature every call compiles to nothing.

#[cfg(feature = "metrics")]
use tokenrelay_core::metrics::relay_meters;

pub fn session_opened() {
    #[cfg(feature = "metrics")]
    relay_meters().sessions_opened.add(1, &[]);
}

pub fn session_closed() {
    #[cfg(feature = "metrics")]
    relay_meters().sessions_closed.add(1, &[]);
}

pub fn reconnect_attempt() {
    #[cfg(feature = "metrics")]
    relay_meters().reconnect_attempts.add(1, &[]);
}

pub fn reconnect_exhausted() {
    #[cfg(feature = "metrics")]
    relay_meters().reconnect_exhausted.add(1, &[]);
}

pub fn message_forwarded() {
    #[cfg(feature = "metrics")]
    relay_meters().messages_forwarded.add(1, &[]);
}

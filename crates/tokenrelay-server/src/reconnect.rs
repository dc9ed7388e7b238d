//! Agent link state and the reconnection policy.

use std::fmt;
use std::time::Duration;

use tokenrelay_core::Config;
use tokenrelay_core::config::ReconnectConfig;

use crate::endpoint::EndpointSettings;

/// State of a session's agent side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// An agent endpoint is attached and forwarding.
    Connected,
    /// The previous agent endpoint is gone and redials are in progress.
    Reconnecting,
    /// The retry budget ran out. Terminal.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting => f.write_str("reconnecting"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Exponential backoff for agent redials.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first redial.
    pub base_interval: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Dial attempts per reconnection run.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_interval: Duration::from_millis(config.base_interval_millis),
            multiplier: 2.0,
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_retries: config.max_retries,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before dial attempt `attempt` (1-based): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_interval.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether dial attempt `attempt` (1-based) is within budget.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }
}

/// Everything a session needs from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: EndpointSettings,
    pub reconnect: ReconnectPolicy,
    /// Pause between the `exit` notification and teardown, so the client
    /// can read it.
    pub exit_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: EndpointSettings::from(&config.session),
            reconnect: ReconnectPolicy::from(&config.reconnect),
            exit_grace: config.session.exit_grace(),
        }
    }
}

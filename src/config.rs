//! Client configuration.
//!
//! A [`ClientConfig`] can be built in code, loaded from a JSON file, and
//! adjusted through `CONNECTME_*` environment variables. Every field has a
//! default except the address.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// How long to wait before the next connection attempt after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// The same delay before every attempt.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Delay doubling per consecutive failed attempt, capped at `max_ms`.
    Exponential {
        /// Delay before the first attempt, in milliseconds.
        initial_ms: u64,
        /// Upper bound for the delay, in milliseconds.
        max_ms: u64,
        /// Add up to one second of random jitter to each delay.
        jitter: bool,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: duration_ms(constants::DEFAULT_RECONNECT_DELAY),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff starting at the default fixed delay.
    #[must_use]
    pub fn exponential() -> Self {
        Self::Exponential {
            initial_ms: duration_ms(constants::DEFAULT_RECONNECT_DELAY),
            max_ms: duration_ms(constants::DEFAULT_MAX_RECONNECT_DELAY),
            jitter: true,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(16);
                let base = initial_ms.saturating_mul(1u64 << exponent).min(max_ms);
                let jitter_ms = if jitter {
                    rand::random::<u64>() % constants::RECONNECT_JITTER_MS
                } else {
                    0
                };
                Duration::from_millis(base + jitter_ms)
            }
        }
    }
}

/// Settings for a [`crate::Client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the remote endpoint, e.g. `wss://example.com/socket`.
    pub address: String,
    /// Sub-protocols requested during the handshake, in preference order.
    pub protocols: Vec<String>,
    /// Reconnect automatically after the transport closes.
    pub auto_reconnect: bool,
    /// Seconds a query may stay unanswered.
    pub query_timeout_secs: u64,
    /// Delay policy between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Milliseconds between timeout sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            protocols: Vec::new(),
            auto_reconnect: true,
            query_timeout_secs: constants::DEFAULT_QUERY_TIMEOUT.as_secs(),
            reconnect: ReconnectPolicy::default(),
            sweep_interval_ms: duration_ms(constants::DEFAULT_SWEEP_INTERVAL),
        }
    }
}

impl ClientConfig {
    /// Defaults for everything but `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the requested sub-protocols.
    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the query timeout in whole seconds.
    #[must_use]
    pub fn with_query_timeout_secs(mut self, secs: u64) -> Self {
        self.query_timeout_secs = secs;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Load from a JSON file, then apply environment overrides.
    ///
    /// Missing fields take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CONNECTME_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var(constants::ENV_ADDRESS) {
            self.address = address;
        }

        if let Ok(protocols) = std::env::var(constants::ENV_PROTOCOLS) {
            self.protocols = protocols
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(auto_reconnect) = std::env::var(constants::ENV_AUTO_RECONNECT) {
            if let Ok(enabled) = auto_reconnect.parse::<bool>() {
                self.auto_reconnect = enabled;
            }
        }

        if let Ok(timeout) = std::env::var(constants::ENV_QUERY_TIMEOUT) {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.query_timeout_secs = secs;
            }
        }

        if let Ok(delay) = std::env::var(constants::ENV_RECONNECT_DELAY_MS) {
            if let Ok(delay_ms) = delay.parse::<u64>() {
                self.reconnect = ReconnectPolicy::Fixed { delay_ms };
            }
        }
    }

    /// Check that the configuration can be used to connect.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            anyhow::bail!("address must not be empty");
        }
        if self.sweep_interval_ms == 0 {
            anyhow::bail!("sweep_interval_ms must be greater than zero");
        }
        Ok(())
    }

    /// Query timeout as a `Duration`.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Sweep period as a `Duration`.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

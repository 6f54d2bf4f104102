//! Crate-wide defaults for connectme.
//!
//! This module centralizes the timing constants of the client so that the
//! configuration layer, the connection state machine and the tests all agree
//! on the same values.
//!
//! # Categories
//!
//! - **Queries**: timeout and sweep cadence for pending queries
//! - **Reconnection**: delays used between connection attempts
//! - **Environment**: variable names read by [`crate::config`]

use std::time::Duration;

// ============================================================================
// Queries
// ============================================================================

/// Default time a query may stay unanswered before it is rejected.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the sweep that rejects timed out queries.
///
/// A query is therefore rejected somewhere between `timeout` and
/// `timeout + SWEEP_INTERVAL` after it was issued.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Reconnection
// ============================================================================

/// Fixed delay between a transport close and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Upper bound for the exponential reconnect policy.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Maximum random jitter added to exponential reconnect delays.
pub const RECONNECT_JITTER_MS: u64 = 1000;

// ============================================================================
// Environment
// ============================================================================

/// Overrides [`crate::ClientConfig::address`].
pub const ENV_ADDRESS: &str = "CONNECTME_ADDRESS";

/// Comma separated list overriding [`crate::ClientConfig::protocols`].
pub const ENV_PROTOCOLS: &str = "CONNECTME_PROTOCOLS";

/// `true`/`false` override for [`crate::ClientConfig::auto_reconnect`].
pub const ENV_AUTO_RECONNECT: &str = "CONNECTME_AUTO_RECONNECT";

/// Query timeout override, in seconds.
pub const ENV_QUERY_TIMEOUT: &str = "CONNECTME_QUERY_TIMEOUT";

/// Fixed reconnect delay override, in milliseconds.
pub const ENV_RECONNECT_DELAY_MS: &str = "CONNECTME_RECONNECT_DELAY_MS";

//! Runtime tuning for the lifecycle manager and dispatcher.
//!
//! # Invariants
//! - Every field has a usable default; invalid overrides fall back to it.

use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_LATEST_TIMEOUT_MS: &str = "CONTRACT_LATEST_TIMEOUT_MS";
pub const ENV_EVENT_CHANNEL_CAPACITY: &str = "CONTRACT_EVENT_CHANNEL_CAPACITY";
pub const ENV_DISPATCH_POLL_MS: &str = "CONTRACT_DISPATCH_POLL_MS";
pub const ENV_ACK_HISTORY_LIMIT: &str = "CONTRACT_ACK_HISTORY_LIMIT";

const DEFAULT_LATEST_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_DISPATCH_POLL_MS: u64 = 50;
const DEFAULT_ACK_HISTORY_LIMIT: usize = 1_024;

/// Lifecycle manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Upper bound `latest()` waits for a just-spawned contract.
    pub latest_timeout_ms: u64,
    /// Per-subscription queue depth before delivery blocks.
    pub event_channel_capacity: usize,
    /// How often the dispatcher re-checks for shutdown while idle.
    pub dispatch_poll_interval_ms: u64,
    /// How many informative evids a handle remembers for idempotent acks.
    pub ack_history_limit: usize,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            latest_timeout_ms: DEFAULT_LATEST_TIMEOUT_MS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            dispatch_poll_interval_ms: DEFAULT_DISPATCH_POLL_MS,
            ack_history_limit: DEFAULT_ACK_HISTORY_LIMIT,
        }
    }
}

impl ContractConfig {
    /// Builds a config from `CONTRACT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            latest_timeout_ms: read_override(&lookup, ENV_LATEST_TIMEOUT_MS, 0)
                .unwrap_or(defaults.latest_timeout_ms),
            event_channel_capacity: read_override(&lookup, ENV_EVENT_CHANNEL_CAPACITY, 1)
                .map(|value| value as usize)
                .unwrap_or(defaults.event_channel_capacity),
            dispatch_poll_interval_ms: read_override(&lookup, ENV_DISPATCH_POLL_MS, 1)
                .unwrap_or(defaults.dispatch_poll_interval_ms),
            ack_history_limit: read_override(&lookup, ENV_ACK_HISTORY_LIMIT, 1)
                .map(|value| value as usize)
                .unwrap_or(defaults.ack_history_limit),
        }
        .normalized()
    }

    /// Replaces out-of-range values with defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.event_channel_capacity == 0 {
            self.event_channel_capacity = defaults.event_channel_capacity;
        }
        if self.dispatch_poll_interval_ms == 0 {
            self.dispatch_poll_interval_ms = defaults.dispatch_poll_interval_ms;
        }
        if self.ack_history_limit == 0 {
            self.ack_history_limit = defaults.ack_history_limit;
        }
        self
    }

    pub fn latest_timeout(&self) -> Duration {
        Duration::from_millis(self.latest_timeout_ms)
    }

    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms)
    }
}

fn read_override(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    minimum: u64,
) -> Option<u64> {
    let raw = lookup(name)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(value) if value >= minimum => Some(value),
        _ => {
            warn!(
                "event=config_override module=config status=ignored name={} value={}",
                name, trimmed
            );
            None
        }
    }
}

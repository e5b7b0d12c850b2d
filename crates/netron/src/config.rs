//! # Netron Configuration
//!
//! All fields have defaults, so an empty TOML document is a valid configuration.
//! Durations are in milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    pub protocol: String,
    pub default_port: u16,
    /// Extra transport-level connect attempts after the first failure.
    pub reconnects: u32,
    pub retry_timeout: u64,
    pub retry_max_timeout: u64,
    /// How long a caller waits for a correlated reply.
    pub response_timeout: u64,
    /// Whether inline twin sources carried by remote definitions are honoured.
    pub accept_twins: bool,
    /// Whether this node hosts contexts attached remotely on behalf of others.
    pub is_super: bool,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            protocol: "netron:".to_string(),
            default_port: 8888,
            reconnects: 3,
            retry_timeout: 300,
            retry_max_timeout: 3000,
            response_timeout: 180_000,
            accept_twins: true,
            is_super: false,
        }
    }
}

impl NetronConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidArgument(format!("invalid netron config: {e}")))
    }

    pub fn response_deadline(&self) -> Duration {
        Duration::from_millis(self.response_timeout)
    }

    /// Back-off before retry `attempt` (1-based): doubles from `retry_timeout`,
    /// capped at `retry_max_timeout`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self.retry_timeout.saturating_mul(factor).min(self.retry_max_timeout);
        Duration::from_millis(millis)
    }
}

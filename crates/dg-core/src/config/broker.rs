//! Broker daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::{GatewayConfig, MachineProfile};
use crate::error::ConfigError;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the HTTP API binds to
    pub bind_address: String,

    /// Remote-access gateway
    pub gateway: GatewayConfig,

    /// Per-session timeouts and buffers
    pub session: SessionConfig,

    /// Backoff between gateway retries
    pub backoff: BackoffConfig,

    /// Interval between status reconciliation passes
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,

    /// How long terminal sessions stay listable
    #[serde(with = "duration_secs")]
    pub terminal_retention: Duration,

    /// Machines seeded into the in-memory registry
    pub machines: HashMap<String, MachineProfile>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8001".to_string(),
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            backoff: BackoffConfig::default(),
            sync_interval: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(300),
            machines: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Reject values the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid("sync_interval must be positive".into()));
        }
        self.session.validate()?;
        self.backoff.validate()?;
        for (id, profile) in &self.machines {
            if profile.host.is_empty() {
                return Err(ConfigError::Invalid(format!("machine {} has no host", id)));
            }
        }
        Ok(())
    }
}

/// Per-session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attempts for authentication and for tunnel establishment
    pub max_attempts: u32,

    /// Limit for opening the tunnel and receiving the handshake ack
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Limit for a session to reach a terminal state after Close
    #[serde(with = "duration_secs")]
    pub close_timeout: Duration,

    /// Interval between keepalive `nop` instructions on an idle tunnel
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Input events buffered between the caller and the session actor
    pub input_queue_capacity: usize,

    /// Output frames buffered per subscriber before it starts lagging
    pub output_buffer: usize,

    /// Requested remote display geometry
    pub display: DisplaySize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            handshake_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            input_queue_capacity: 256,
            output_buffer: 1024,
            display: DisplaySize::default(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("session.max_attempts must be at least 1".into()));
        }
        if self.input_queue_capacity == 0 || self.output_buffer == 0 {
            return Err(ConfigError::Invalid("session buffers must be non-empty".into()));
        }
        if self.close_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("session timeouts must be positive".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "session.keepalive_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Remote display geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            dpi: 96,
        }
    }
}

const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.multiplier) {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be within 1.0..={}",
                MAX_BACKOFF_MULTIPLIER
            )));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid("backoff.initial must not exceed backoff.max".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("backoff.jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

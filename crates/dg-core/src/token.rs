//! Gateway authentication token

use std::time::Duration;

use tokio::time::Instant;

use crate::types::Secret;

/// Short-lived bearer token issued by the gateway
///
/// Held in memory only. Sessions share it read-only until it expires.
#[derive(Debug, Clone)]
pub struct AuthToken {
    /// Opaque token value
    pub value: Secret,
    /// Gateway user the token was issued for
    pub username: String,
    /// Data source the gateway assigned to this login
    pub data_source: String,
    /// Instant after which the gateway no longer honours the token.
    /// Measured on the tokio clock.
    pub expires_at: Instant,
}

impl AuthToken {
    /// Create a token valid for `ttl` from now
    pub fn new(
        value: impl Into<Secret>,
        username: impl Into<String>,
        data_source: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            value: value.into(),
            username: username.into(),
            data_source: data_source.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Whether the token expires within `skew` of now
    pub fn expires_within(&self, skew: Duration) -> bool {
        Instant::now() + skew >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }
}

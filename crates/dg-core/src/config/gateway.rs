//! Remote-access gateway configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::Secret;

/// How to reach and log in to the remote-access gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway web application
    pub base_url: String,

    /// WebSocket tunnel endpoint
    pub tunnel_url: String,

    /// Gateway account used to obtain tokens
    pub username: String,

    /// Gateway account password
    pub password: Secret,

    /// Data source connections are provisioned in
    pub data_source: String,

    /// Lifetime assumed for issued tokens
    #[serde(with = "duration_secs")]
    pub token_ttl: Duration,

    /// Tokens this close to expiry are renewed before use
    #[serde(with = "duration_secs")]
    pub refresh_skew: Duration,

    /// Timeout for REST calls
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/guacamole".to_string(),
            tunnel_url: "ws://localhost:8080/guacamole/websocket-tunnel".to_string(),
            username: "guacadmin".to_string(),
            password: Secret::new("guacadmin"),
            data_source: "postgresql".to_string(),
            token_ttl: Duration::from_secs(3600),
            refresh_skew: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Token endpoint
    pub fn tokens_url(&self) -> String {
        format!("{}/api/tokens", self.base_url.trim_end_matches('/'))
    }

    /// Connection collection of a data source
    pub fn connections_url(&self, data_source: &str) -> String {
        format!(
            "{}/api/session/data/{}/connections",
            self.base_url.trim_end_matches('/'),
            data_source
        )
    }

    /// A single provisioned connection
    pub fn connection_url(&self, data_source: &str, identifier: &str) -> String {
        format!("{}/{}", self.connections_url(data_source), identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_tolerate_trailing_slash() {
        let config = GatewayConfig {
            base_url: "http://gw:8080/guacamole/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tokens_url(), "http://gw:8080/guacamole/api/tokens");
        assert_eq!(
            config.connection_url("postgresql", "12"),
            "http://gw:8080/guacamole/api/session/data/postgresql/connections/12"
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = GatewayConfig {
            password: Secret::new("s3cr3t-admin"),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("s3cr3t-admin"));
    }
}

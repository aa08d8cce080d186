//! Remote-access gateway client
//!
//! Token acquisition with caching and retry, connection provisioning over
//! REST, and the WebSocket instruction tunnel.

mod auth;
mod backoff;
mod http;
mod tunnel;

pub use auth::GatewayAuthClient;
pub use backoff::RetryBackoff;
pub use http::GatewayRestClient;
pub use tunnel::{tunnel_url, WebSocketTunnel, WebSocketTunnelConnector, TUNNEL_SUBPROTOCOL};

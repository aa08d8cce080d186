//! Daemon state shared by the HTTP API and background tasks

use std::sync::Arc;

use dg_core::config::BrokerConfig;
use dg_core::traits::{MachineRegistry, TokenEndpoint};
use dg_core::{GatewayError, InMemoryRegistry};

use crate::broker::ConnectionBroker;
use crate::gateway::{GatewayAuthClient, GatewayRestClient, WebSocketTunnelConnector};
use crate::sync::StatusSynchronizer;

/// Global state for the broker daemon
pub struct DaemonState {
    pub config: BrokerConfig,
    pub registry: Arc<dyn MachineRegistry>,
    pub broker: Arc<ConnectionBroker>,
}

impl DaemonState {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<dyn MachineRegistry>,
        broker: Arc<ConnectionBroker>,
    ) -> Self {
        Self {
            config,
            registry,
            broker,
        }
    }

    /// Wire the gateway clients and an in-memory registry seeded from
    /// the configured machine profiles
    pub fn from_config(config: BrokerConfig) -> Result<Self, GatewayError> {
        let registry: Arc<dyn MachineRegistry> =
            Arc::new(InMemoryRegistry::from_profiles(&config.machines));

        let rest = Arc::new(GatewayRestClient::new(config.gateway.clone())?);
        let auth = Arc::new(GatewayAuthClient::new(
            Arc::clone(&rest) as Arc<dyn TokenEndpoint>,
            config.backoff.clone(),
            config.session.max_attempts,
            config.gateway.refresh_skew,
        ));
        let connector = Arc::new(WebSocketTunnelConnector::new(rest));

        let broker = Arc::new(ConnectionBroker::new(
            Arc::clone(&registry),
            auth,
            connector,
            config.session.clone(),
            config.backoff.clone(),
        ));

        Ok(Self::new(config, registry, broker))
    }

    /// Status synchronizer over this state's broker
    pub fn synchronizer(&self) -> StatusSynchronizer {
        StatusSynchronizer::new(
            Arc::clone(&self.broker),
            self.config.sync_interval,
            self.config.terminal_retention,
        )
    }
}

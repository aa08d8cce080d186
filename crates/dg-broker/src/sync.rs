//! Status synchronizer
//!
//! Background task that keeps machine statuses consistent with the
//! session table. Each pass:
//! - fails sessions whose actor exited without running teardown
//! - corrects machines whose status disagrees with their live session
//! - drops terminal sessions older than the retention window
//!
//! Passes are idempotent and run concurrently with broker operations;
//! anything missed is picked up on the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use dg_core::time::current_time_millis;

use crate::broker::ConnectionBroker;
use crate::session::TerminationCause;

/// What a reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Sessions whose actor was found dead
    pub orphaned: usize,
    /// Machine statuses rewritten
    pub corrected: usize,
    /// Terminal sessions removed from the table
    pub purged: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned == 0 && self.corrected == 0 && self.purged == 0
    }
}

pub struct StatusSynchronizer {
    broker: Arc<ConnectionBroker>,
    interval: Duration,
    retention: Duration,
}

impl StatusSynchronizer {
    pub fn new(broker: Arc<ConnectionBroker>, interval: Duration, retention: Duration) -> Self {
        Self {
            broker,
            interval,
            retention,
        }
    }

    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Starting status synchronizer (interval: {:?}, retention: {:?})",
            self.interval,
            self.retention
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.reconcile_once().await;
                    if !report.is_empty() {
                        tracing::info!(
                            "Status sync: {} orphaned, {} corrected, {} purged",
                            report.orphaned,
                            report.corrected,
                            report.purged
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Status synchronizer shutting down");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass
    pub async fn reconcile_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let propagator = self.broker.propagator();

        for handle in self.broker.table().list() {
            if !handle.state().is_terminal() && handle.task_finished() {
                tracing::warn!(
                    "{} on {} lost its actor in state {}",
                    handle.id,
                    handle.machine_id,
                    handle.state()
                );
                if propagator
                    .force_fail(&handle, TerminationCause::ActorLost)
                    .await
                {
                    report.orphaned += 1;
                }
            } else if !handle.is_finalized()
                && handle.task_finished()
                && propagator.settle(&handle).await
            {
                report.orphaned += 1;
            }
        }

        match self.broker.registry().list().await {
            Ok(machines) => {
                for machine in machines {
                    if propagator
                        .reconcile_machine(&machine.id)
                        .await
                        .is_some()
                    {
                        report.corrected += 1;
                    }
                }
            }
            Err(e) => tracing::error!("Status sync could not list machines: {}", e),
        }

        let cutoff = current_time_millis().saturating_sub(self.retention.as_millis() as u64);
        report.purged = self.broker.table().purge_ended_before(cutoff);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dg_core::config::{BackoffConfig, SessionConfig};
    use dg_core::traits::{MachineRegistry, TokenEndpoint, Tunnel, TunnelConnector, TunnelRequest};
    use dg_core::{
        AuthToken, Credentials, GatewayError, InMemoryRegistry, Machine, MachineId, MachineStatus,
    };

    use crate::gateway::GatewayAuthClient;

    struct Unreachable;

    #[async_trait]
    impl TokenEndpoint for Unreachable {
        async fn request_token(&self) -> Result<AuthToken, GatewayError> {
            Err(GatewayError::Rejected("offline".into()))
        }
    }

    #[async_trait]
    impl TunnelConnector for Unreachable {
        async fn connect(
            &self,
            _token: &AuthToken,
            _request: &TunnelRequest,
        ) -> Result<Box<dyn Tunnel>, GatewayError> {
            Err(GatewayError::Closed)
        }
    }

    fn synchronizer(registry: Arc<InMemoryRegistry>, retention: Duration) -> StatusSynchronizer {
        let auth = Arc::new(GatewayAuthClient::new(
            Arc::new(Unreachable),
            BackoffConfig::default(),
            1,
            Duration::from_secs(30),
        ));
        let broker = Arc::new(ConnectionBroker::new(
            registry,
            auth,
            Arc::new(Unreachable),
            SessionConfig::default(),
            BackoffConfig::default(),
        ));
        StatusSynchronizer::new(broker, Duration::from_secs(30), retention)
    }

    #[tokio::test]
    async fn test_stale_busy_status_is_reset() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut machine = Machine::new("m1", "10.0.0.1", Credentials::default());
        machine.status = MachineStatus::Active;
        registry.insert(machine);
        let sync = synchronizer(Arc::clone(&registry), Duration::from_secs(300));

        let report = sync.reconcile_once().await;
        assert_eq!(report.corrected, 1);
        assert_eq!(
            registry.get(&MachineId::new("m1")).await.unwrap().status,
            MachineStatus::Inactive
        );

        // Second pass has nothing to do
        assert!(sync.reconcile_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_sessions_are_purged_after_retention() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.insert(Machine::new("m1", "10.0.0.1", Credentials::default()));
        let sync = synchronizer(Arc::clone(&registry), Duration::ZERO);

        let info = sync.broker.create(&MachineId::new("m1")).await.unwrap();
        let handle = sync.broker.table().get(info.id).unwrap();
        handle.wait_finalized().await;
        assert!(sync.broker.table().live_for(&MachineId::new("m1")).is_none());
        assert_eq!(
            registry.get(&MachineId::new("m1")).await.unwrap().status,
            MachineStatus::Error
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = sync.reconcile_once().await;
        assert_eq!(report.purged, 1);
        assert!(sync.broker.list().is_empty());
        // Error is not a busy claim and stays visible
        assert_eq!(report.corrected, 0);
    }
}

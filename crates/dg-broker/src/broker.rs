//! Connection broker
//!
//! Creates and closes sessions, enforces the one-live-session-per-machine
//! rule and hands each session to its own actor. All operations return
//! without waiting on the gateway except [`ConnectionBroker::close`],
//! which waits at most the configured close timeout.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use dg_core::config::{BackoffConfig, SessionConfig};
use dg_core::traits::{ConnectionDescriptor, MachineRegistry, TunnelConnector, TunnelRequest};
use dg_core::{MachineId, SessionError};
use dg_protocol::{InputEvent, SessionId};

use crate::gateway::GatewayAuthClient;
use crate::session::{
    InputDisposition, SessionActor, SessionContext, SessionHandle, SessionInfo, SessionState,
    SessionSubscription, SessionTable, StatusPropagator, TerminationCause,
};

/// Result of a close request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// The session shut down within the close timeout
    Closed,
    /// The session had already ended; nothing was done
    AlreadyTerminated,
    /// No session with this ID
    NotFound,
    /// The session ignored the close request and was marked failed
    ForceTerminated,
}

/// Brokers sessions between users and registered machines
pub struct ConnectionBroker {
    registry: Arc<dyn MachineRegistry>,
    table: Arc<SessionTable>,
    propagator: Arc<StatusPropagator>,
    ctx: Arc<SessionContext>,
}

impl ConnectionBroker {
    pub fn new(
        registry: Arc<dyn MachineRegistry>,
        auth: Arc<GatewayAuthClient>,
        connector: Arc<dyn TunnelConnector>,
        session: SessionConfig,
        backoff: BackoffConfig,
    ) -> Self {
        let table = Arc::new(SessionTable::new());
        let propagator = Arc::new(StatusPropagator::new(
            Arc::clone(&registry),
            Arc::clone(&table),
        ));
        let ctx = Arc::new(SessionContext {
            auth,
            connector,
            propagator: Arc::clone(&propagator),
            session,
            backoff,
        });
        Self {
            registry,
            table,
            propagator,
            ctx,
        }
    }

    pub fn registry(&self) -> &Arc<dyn MachineRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn propagator(&self) -> &Arc<StatusPropagator> {
        &self.propagator
    }

    /// Start a session to `machine_id`.
    ///
    /// Returns as soon as the session is registered, in `pending`; the
    /// handshake runs in the session's actor.
    pub async fn create(&self, machine_id: &MachineId) -> Result<SessionInfo, SessionError> {
        let machine = self.registry.get(machine_id).await?;

        let config = &self.ctx.session;
        let (handle, input_rx) = SessionHandle::new(
            self.table.allocate_id(),
            machine.id.clone(),
            config.input_queue_capacity,
            config.output_buffer,
        );
        let handle = Arc::new(handle);
        if let Err(e) = self.table.try_reserve(Arc::clone(&handle)) {
            tracing::info!("Refusing session for {}: already connected", machine_id);
            return Err(e);
        }
        self.propagator.begin(&handle).await;

        let info = handle.info();
        let request = TunnelRequest {
            session_id: handle.id,
            descriptor: ConnectionDescriptor::from(&machine),
            display: config.display,
        };
        SessionActor::new(Arc::clone(&handle), Arc::clone(&self.ctx), request, input_rx).spawn();

        tracing::info!("Created {} for machine {}", handle.id, machine_id);
        Ok(info)
    }

    /// Close a session at the user's request. Idempotent.
    pub async fn close(&self, id: SessionId) -> CloseOutcome {
        self.close_with(id, TerminationCause::UserClose).await
    }

    async fn close_with(&self, id: SessionId, cause: TerminationCause) -> CloseOutcome {
        let Some(handle) = self.table.get(id) else {
            return CloseOutcome::NotFound;
        };
        let limit = self.ctx.session.close_timeout;
        if handle.state().is_terminal() {
            // The ending actor may still be writing the machine status
            let _ = tokio::time::timeout(limit, handle.wait_finalized()).await;
            return CloseOutcome::AlreadyTerminated;
        }

        tracing::info!("Closing {} ({:?})", id, cause);
        handle.request_close(cause);

        if tokio::time::timeout(limit, handle.wait_finalized())
            .await
            .is_ok()
        {
            tracing::debug!("{} ended as {}", id, handle.state());
            return CloseOutcome::Closed;
        }

        if self
            .propagator
            .force_fail(&handle, TerminationCause::CloseTimeout)
            .await
        {
            tracing::error!(
                "{} did not close within {:?}, force-terminated leaked session",
                id,
                limit
            );
            handle.abort_task();
            CloseOutcome::ForceTerminated
        } else {
            // The actor finished while the force-fail waited for the machine lock
            self.propagator.settle(&handle).await;
            tracing::debug!("{} ended as {} past the close timeout", id, handle.state());
            CloseOutcome::Closed
        }
    }

    /// All sessions still in the table, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        self.table.list().iter().map(|h| h.info()).collect()
    }

    /// Sessions that have not reached a terminal state
    pub fn list_active(&self) -> Vec<SessionInfo> {
        self.table
            .list()
            .iter()
            .filter(|h| !h.state().is_terminal())
            .map(|h| h.info())
            .collect()
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.table.get(id).map(|h| h.info())
    }

    /// Every state the session has been in
    pub fn history(&self, id: SessionId) -> Option<Vec<SessionState>> {
        self.table.get(id).map(|h| h.history())
    }

    /// Subscribe to a session's state changes and output
    pub fn subscribe(&self, id: SessionId) -> Result<SessionSubscription, SessionError> {
        self.table
            .get(id)
            .map(|h| h.subscribe())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Submit an input event to a session
    pub async fn send_input(
        &self,
        id: SessionId,
        event: InputEvent,
    ) -> Result<InputDisposition, SessionError> {
        let handle = self
            .table
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(handle.submit_input(event).await)
    }

    /// Close every live session concurrently
    pub async fn shutdown(&self) {
        let live: Vec<SessionId> = self
            .table
            .list()
            .iter()
            .filter(|h| !h.state().is_terminal())
            .map(|h| h.id)
            .collect();
        if live.is_empty() {
            return;
        }

        tracing::info!("Closing {} live sessions", live.len());
        let outcomes = join_all(
            live.into_iter()
                .map(|id| self.close_with(id, TerminationCause::Shutdown)),
        )
        .await;
        let forced = outcomes
            .iter()
            .filter(|o| **o == CloseOutcome::ForceTerminated)
            .count();
        if forced > 0 {
            tracing::warn!("{} sessions had to be force-terminated", forced);
        }
    }
}

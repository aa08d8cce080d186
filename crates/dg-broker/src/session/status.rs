//! Machine status propagation
//!
//! Every registry status write made on behalf of a session goes through
//! [`StatusPropagator`]. Writes for one machine are serialized by a
//! per-machine lock, and a terminal write always lands before the live
//! index entry is released, so a newer session's `connecting` can never be
//! overwritten by an older session's terminal status.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use dg_core::traits::MachineRegistry;
use dg_core::{MachineId, MachineStatus};

use super::handle::SessionHandle;
use super::state::{SessionState, TerminationCause};
use super::table::SessionTable;

/// Serializes session state changes with their registry status writes
pub struct StatusPropagator {
    registry: Arc<dyn MachineRegistry>,
    table: Arc<SessionTable>,
    locks: DashMap<MachineId, Arc<Mutex<()>>>,
}

impl StatusPropagator {
    pub fn new(registry: Arc<dyn MachineRegistry>, table: Arc<SessionTable>) -> Self {
        Self {
            registry,
            table,
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn MachineRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    fn lock_for(&self, machine_id: &MachineId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(machine_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn write(&self, machine_id: &MachineId, status: MachineStatus) {
        if let Err(e) = self.registry.set_status(machine_id, status).await {
            tracing::error!("Failed to set status of {} to {}: {}", machine_id, status, e);
        } else {
            tracing::debug!("Machine {} is now {}", machine_id, status);
        }
    }

    /// Advertise a freshly reserved session as `connecting`
    pub async fn begin(&self, handle: &SessionHandle) {
        let lock = self.lock_for(&handle.machine_id);
        let _guard = lock.lock().await;
        if handle.state().is_terminal() {
            return;
        }
        self.write(&handle.machine_id, MachineStatus::Connecting).await;
    }

    /// Move a session to a non-terminal state, updating the machine
    /// status if the visible status changes.
    ///
    /// Returns false if the transition was rejected.
    pub async fn advance(&self, handle: &SessionHandle, next: SessionState) -> bool {
        let lock = self.lock_for(&handle.machine_id);
        let _guard = lock.lock().await;

        let before = handle.state().live_status();
        if !handle.transition(next) {
            tracing::debug!(
                "{} rejected transition {} -> {}",
                handle.id,
                handle.state(),
                next
            );
            return false;
        }
        tracing::debug!("{} is now {}", handle.id, next);

        if let Some(status) = next.live_status() {
            if before != Some(status) {
                self.write(&handle.machine_id, status).await;
            }
        }
        true
    }

    /// Move a session to a terminal state exactly once.
    ///
    /// The machine status is written from the recorded cause (or
    /// `fallback` when none was recorded) and the live index entry is
    /// released afterwards. A session that is already terminal is left
    /// untouched and false is returned.
    pub async fn finish(
        &self,
        handle: &SessionHandle,
        terminal: SessionState,
        fallback: TerminationCause,
    ) -> bool {
        debug_assert!(terminal.is_terminal());
        let lock = self.lock_for(&handle.machine_id);
        let _guard = lock.lock().await;

        if !handle.transition(terminal) {
            return false;
        }
        handle.record_cause(fallback);
        let cause = handle.cause().unwrap_or(TerminationCause::UserClose);
        let status = cause.terminal_status();

        match &cause {
            TerminationCause::UserClose | TerminationCause::Shutdown => {
                tracing::info!("{} on {} {}", handle.id, handle.machine_id, terminal)
            }
            other => tracing::warn!(
                "{} on {} {} ({:?})",
                handle.id,
                handle.machine_id,
                terminal,
                other
            ),
        }

        self.write(&handle.machine_id, status).await;
        self.table.release(&handle.machine_id, handle.id);
        handle.mark_finalized();
        true
    }

    /// Force a session whose actor is unresponsive or gone into `failed`
    /// with the given cause, replacing any cause recorded earlier.
    pub async fn force_fail(&self, handle: &SessionHandle, cause: TerminationCause) -> bool {
        let lock = self.lock_for(&handle.machine_id);
        let _guard = lock.lock().await;

        if !handle.transition(SessionState::Failed) {
            return false;
        }
        handle.override_cause(cause.clone());
        tracing::warn!(
            "{} on {} force-failed ({:?})",
            handle.id,
            handle.machine_id,
            cause
        );
        self.write(&handle.machine_id, cause.terminal_status()).await;
        self.table.release(&handle.machine_id, handle.id);
        handle.mark_finalized();
        true
    }

    /// Release a terminal session whose actor died before it could write
    /// the terminal status.
    ///
    /// Returns false if the session was not terminal or already released.
    pub async fn settle(&self, handle: &SessionHandle) -> bool {
        let lock = self.lock_for(&handle.machine_id);
        let _guard = lock.lock().await;

        if !handle.state().is_terminal() || handle.is_finalized() {
            return false;
        }
        let cause = handle.cause().unwrap_or(TerminationCause::ActorLost);
        tracing::warn!(
            "{} on {} ended as {} without releasing its machine",
            handle.id,
            handle.machine_id,
            handle.state()
        );
        self.write(&handle.machine_id, cause.terminal_status()).await;
        self.table.release(&handle.machine_id, handle.id);
        handle.mark_finalized();
        true
    }

    /// Bring a machine's registry status in line with its live session.
    ///
    /// The recorded status is read under the machine's lock, so a terminal
    /// write that lands while a pass is running is never overwritten.
    /// Returns the status written if a correction was needed.
    pub async fn reconcile_machine(&self, machine_id: &MachineId) -> Option<MachineStatus> {
        let lock = self.lock_for(machine_id);
        let _guard = lock.lock().await;

        let recorded = match self.registry.get(machine_id).await {
            Ok(machine) => machine.status,
            Err(e) => {
                tracing::debug!("Skipping reconcile of {}: {}", machine_id, e);
                return None;
            }
        };

        let expected = match self.table.live_for(machine_id).and_then(|id| self.table.get(id)) {
            Some(handle) => match handle.state().live_status() {
                Some(status) => status,
                // Disconnecting: the actor will write the terminal status
                None => return None,
            },
            // Error is a sticky terminal report; only busy claims are stale
            None if recorded.is_busy() => MachineStatus::Inactive,
            None => return None,
        };

        if expected == recorded {
            return None;
        }
        tracing::info!(
            "Correcting status of {} from {} to {}",
            machine_id,
            recorded,
            expected
        );
        self.write(machine_id, expected).await;
        Some(expected)
    }
}

//! Session table and live-session index

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dg_core::{MachineId, SessionError};
use dg_protocol::SessionId;

use super::handle::SessionHandle;

/// All sessions known to the broker, plus the machine -> live session index
///
/// The live index holds at most one entry per machine. An entry is
/// reserved before the session actor starts and released only after the
/// session's terminal status has been written.
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    live: DashMap<MachineId, SessionId>,
    next_session_id: AtomicU32,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            live: DashMap::new(),
            next_session_id: AtomicU32::new(1),
        }
    }

    /// Allocate a new session ID
    pub fn allocate_id(&self) -> SessionId {
        SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Reserve the machine for `handle` and register the session.
    ///
    /// Fails with `AlreadyConnected` if another session holds the machine.
    pub fn try_reserve(&self, handle: Arc<SessionHandle>) -> Result<(), SessionError> {
        match self.live.entry(handle.machine_id.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    "Machine {} already held by {}",
                    handle.machine_id,
                    existing.get()
                );
                Err(SessionError::AlreadyConnected(handle.machine_id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.id);
                self.sessions.insert(handle.id, handle);
                Ok(())
            }
        }
    }

    /// Drop the live-index entry for `machine_id` if it still points at `session_id`
    pub fn release(&self, machine_id: &MachineId, session_id: SessionId) -> bool {
        self.live
            .remove_if(machine_id, |_, live| *live == session_id)
            .is_some()
    }

    /// Live session for a machine
    pub fn live_for(&self, machine_id: &MachineId) -> Option<SessionId> {
        self.live.get(machine_id).map(|r| *r)
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|r| Arc::clone(&r))
    }

    /// List all sessions, oldest first
    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Remove a session from the table
    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    /// Remove terminal sessions that ended before `cutoff` (ms since epoch)
    pub fn purge_ended_before(&self, cutoff: u64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| {
            !(handle.state().is_terminal() && handle.ended_at().is_some_and(|t| t < cutoff))
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Number of sessions in the table
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Shared view of one session
//!
//! The session actor is the only writer of the state field in normal
//! operation; the broker writes it only when force-terminating a session
//! whose actor is gone. Every write goes through [`SessionHandle::transition`],
//! which validates the edge and notifies subscribers atomically.

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dg_core::time::current_time_millis;
use dg_core::{MachineId, SessionError};
use dg_protocol::{InputEvent, SessionId};

use super::state::{SessionState, TerminationCause};

/// What happened to a submitted input event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputDisposition {
    /// Queued for the gateway behind earlier events
    Queued,
    /// Session was not connected; the event was discarded
    Dropped,
}

/// Point-in-time description of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub machine_id: MachineId,
    pub state: SessionState,
    /// Tunnel handle assigned by the gateway
    pub connection_handle: Option<String>,
    /// Start time (ms since UNIX epoch)
    pub started_at: u64,
    /// Last input or output (ms since UNIX epoch)
    pub last_activity: u64,
    /// Time the session became terminal
    pub ended_at: Option<u64>,
    /// Failure description for sessions that ended in error
    pub error: Option<String>,
}

/// One item of a session's combined event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionState),
    Output(Bytes),
}

/// Live per-session subscription for the presentation layer
pub struct SessionSubscription {
    /// State changes; holds the current state on creation
    pub status: watch::Receiver<SessionState>,
    /// Output payloads produced from now on
    pub output: broadcast::Receiver<Bytes>,
}

impl SessionSubscription {
    /// Output payloads as a lazy stream that ends when the session does.
    ///
    /// A subscriber that falls behind skips the frames it missed.
    pub fn output_stream(self) -> impl Stream<Item = Bytes> {
        futures::stream::unfold(self.output, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Output subscriber lagged, skipped {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Status changes and output in one stream.
    ///
    /// Starts with the current state and ends after the terminal state
    /// is delivered. Pending output wins over a simultaneous state change,
    /// so frames sent before teardown are not cut off.
    pub fn events(self) -> impl Stream<Item = SessionEvent> {
        let SessionSubscription { mut status, output } = self;
        let current = *status.borrow_and_update();

        futures::stream::unfold(
            (status, output, Some(current), false),
            |(mut status, mut output, pending, ended)| async move {
                if let Some(state) = pending {
                    let ended = state.is_terminal();
                    return Some((SessionEvent::Status(state), (status, output, None, ended)));
                }
                if ended {
                    return None;
                }
                loop {
                    tokio::select! {
                        biased;
                        frame = output.recv() => match frame {
                            Ok(payload) => {
                                return Some((SessionEvent::Output(payload), (status, output, None, false)));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::debug!("Event subscriber lagged, skipped {} frames", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                        changed = status.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                            let state = *status.borrow_and_update();
                            return Some((
                                SessionEvent::Status(state),
                                (status, output, None, state.is_terminal()),
                            ));
                        }
                    }
                }
            },
        )
    }
}

/// Handle to a session shared between broker, actor and synchronizer
pub struct SessionHandle {
    pub id: SessionId,
    pub machine_id: MachineId,
    pub started_at: u64,
    last_activity: AtomicU64,
    ended_at: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    /// Set once the terminal status is written and the machine released
    finalized: watch::Sender<bool>,
    history: Mutex<Vec<SessionState>>,
    cause: Mutex<Option<TerminationCause>>,
    connection_handle: OnceLock<String>,
    input_tx: mpsc::Sender<InputEvent>,
    output_tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Create a pending session. The returned receiver is the input
    /// queue the session actor drains.
    pub fn new(
        id: SessionId,
        machine_id: MachineId,
        input_capacity: usize,
        output_capacity: usize,
    ) -> (Self, mpsc::Receiver<InputEvent>) {
        let (state_tx, _) = watch::channel(SessionState::Pending);
        let (finalized, _) = watch::channel(false);
        let (input_tx, input_rx) = mpsc::channel(input_capacity);
        let (output_tx, _) = broadcast::channel(output_capacity);
        let now = current_time_millis();

        let handle = Self {
            id,
            machine_id,
            started_at: now,
            last_activity: AtomicU64::new(now),
            ended_at: AtomicU64::new(0),
            state_tx,
            finalized,
            history: Mutex::new(vec![SessionState::Pending]),
            cause: Mutex::new(None),
            connection_handle: OnceLock::new(),
            input_tx,
            output_tx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        };
        (handle, input_rx)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns false, changing nothing, when the edge is invalid, which
    /// includes every transition out of a terminal state.
    pub fn transition(&self, next: SessionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            if let Ok(mut history) = self.history.lock() {
                history.push(next);
            }
            if next.is_terminal() {
                self.ended_at.store(current_time_millis(), Ordering::SeqCst);
            }
            true
        })
    }

    /// Every state this session has been in, in order
    pub fn history(&self) -> Vec<SessionState> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Record why the session is ending; the first recorded cause wins
    pub fn record_cause(&self, cause: TerminationCause) {
        if let Ok(mut slot) = self.cause.lock() {
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
    }

    /// Replace the recorded cause (used when force-terminating)
    pub(crate) fn override_cause(&self, cause: TerminationCause) {
        if let Ok(mut slot) = self.cause.lock() {
            *slot = Some(cause);
        }
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause.lock().ok().and_then(|c| c.clone())
    }

    /// Failure surfaced to callers, if the session ended in error
    pub fn failure(&self) -> Option<SessionError> {
        if !self.state().is_terminal() {
            return None;
        }
        self.cause().and_then(|c| c.as_error())
    }

    pub(crate) fn set_connection_handle(&self, handle: String) {
        let _ = self.connection_handle.set(handle);
    }

    pub fn connection_handle(&self) -> Option<&str> {
        self.connection_handle.get().map(String::as_str)
    }

    pub(crate) fn touch(&self) {
        self.last_activity
            .store(current_time_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Time the session became terminal
    pub fn ended_at(&self) -> Option<u64> {
        match self.ended_at.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    /// Subscribe to state changes and output from now on
    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            status: self.state_tx.subscribe(),
            output: self.output_tx.subscribe(),
        }
    }

    pub(crate) fn publish_output(&self, payload: Bytes) {
        // No subscribers is fine: output is not replayable
        let _ = self.output_tx.send(payload);
        self.touch();
    }

    /// Queue an input event for the gateway.
    ///
    /// Events are only accepted while connected; anything else is
    /// reported as dropped rather than as an error.
    pub async fn submit_input(&self, event: InputEvent) -> InputDisposition {
        if self.state() != SessionState::Connected {
            tracing::trace!("Dropping input for {} in state {}", self.id, self.state());
            return InputDisposition::Dropped;
        }
        match self.input_tx.send(event).await {
            Ok(()) => {
                self.touch();
                InputDisposition::Queued
            }
            Err(_) => InputDisposition::Dropped,
        }
    }

    /// Ask the actor to tear the session down
    pub fn request_close(&self, cause: TerminationCause) {
        self.record_cause(cause);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }

    /// Whether the actor task has exited
    pub fn task_finished(&self) -> bool {
        self.task
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(JoinHandle::is_finished))
            .unwrap_or(false)
    }

    /// Kill the actor task without letting it run teardown
    pub fn abort_task(&self) {
        if let Ok(slot) = self.task.lock() {
            if let Some(task) = slot.as_ref() {
                task.abort();
            }
        }
    }

    /// Wait until the session is terminal
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    pub(crate) fn mark_finalized(&self) {
        self.finalized.send_replace(true);
    }

    /// Whether the terminal machine status has been written and the
    /// machine released for a new session
    pub fn is_finalized(&self) -> bool {
        *self.finalized.borrow()
    }

    /// Wait until the session is terminal and its machine released
    pub async fn wait_finalized(&self) {
        let mut rx = self.finalized.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Snapshot for listing
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            machine_id: self.machine_id.clone(),
            state: self.state(),
            connection_handle: self.connection_handle().map(str::to_string),
            started_at: self.started_at,
            last_activity: self.last_activity(),
            ended_at: self.ended_at(),
            error: self.failure().map(|e| e.to_string()),
        }
    }
}

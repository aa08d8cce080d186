//! dg-broker: Connection broker for browser remote desktop sessions
//!
//! The broker maps each registered machine to at most one live session,
//! runs every session as its own actor speaking the gateway instruction
//! protocol over a WebSocket tunnel, and keeps the machine registry's
//! status field consistent with the true session lifecycle.

pub mod api;
pub mod broker;
pub mod gateway;
pub mod session;
pub mod state;
pub mod sync;

pub use broker::{CloseOutcome, ConnectionBroker};
pub use state::DaemonState;
pub use sync::{StatusSynchronizer, SyncReport};

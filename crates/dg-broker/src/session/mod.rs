//! Session management

mod actor;
mod handle;
mod state;
mod status;
mod table;

pub use actor::{SessionActor, SessionContext};
pub use handle::{
    InputDisposition, SessionEvent, SessionHandle, SessionInfo, SessionSubscription,
};
pub use state::{SessionState, TerminationCause};
pub use status::StatusPropagator;
pub use table::SessionTable;

//! dg-core: Core abstractions and configuration for deskgate
//!
//! This crate provides the machine and token types, the error taxonomy,
//! configuration structures, and the traits at the seams between the
//! session broker and its external collaborators (machine registry and
//! remote-access gateway).

pub mod config;
pub mod error;
pub mod registry;
pub mod time;
pub mod token;
pub mod traits;
pub mod types;

pub use error::{ConfigError, GatewayError, RegistryError, SessionError};
pub use registry::InMemoryRegistry;
pub use token::AuthToken;
pub use types::{Credentials, Machine, MachineId, MachineStatus, MachineSummary, OsType, Secret};

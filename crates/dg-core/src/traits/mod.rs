//! Core trait definitions

mod gateway;
mod registry;

pub use gateway::{ConnectionDescriptor, TokenEndpoint, Tunnel, TunnelConnector, TunnelRequest};
pub use registry::MachineRegistry;

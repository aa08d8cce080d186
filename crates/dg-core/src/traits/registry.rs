//! Machine registry trait

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::{Machine, MachineId, MachineStatus};

/// Store of registered machines
///
/// The broker only reads records and writes `status`. Implementations
/// must tolerate concurrent calls from many session actors.
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Fetch a machine by ID
    async fn get(&self, id: &MachineId) -> Result<Machine, RegistryError>;

    /// Overwrite a machine's advertised status
    async fn set_status(&self, id: &MachineId, status: MachineStatus) -> Result<(), RegistryError>;

    /// List all machines
    async fn list(&self) -> Result<Vec<Machine>, RegistryError>;
}

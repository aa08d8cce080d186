//! In-memory machine registry
//!
//! Backs the daemon when machines come from configuration, and serves as
//! the registry in tests. Persistent stores implement the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use crate::config::MachineProfile;
use crate::error::RegistryError;
use crate::time::current_time_millis;
use crate::traits::MachineRegistry;
use crate::types::{Machine, MachineId, MachineStatus};

/// Registry holding machines in a concurrent map
#[derive(Default)]
pub struct InMemoryRegistry {
    machines: DashMap<MachineId, Machine>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
        }
    }

    /// Create a registry seeded from configured profiles
    pub fn from_profiles(profiles: &HashMap<String, MachineProfile>) -> Self {
        let registry = Self::new();
        for (id, profile) in profiles {
            registry.insert(profile.to_machine(id));
        }
        registry
    }

    /// Insert or replace a machine
    pub fn insert(&self, machine: Machine) {
        self.machines.insert(machine.id.clone(), machine);
    }

    /// Remove a machine
    pub fn remove(&self, id: &MachineId) -> Option<Machine> {
        self.machines.remove(id).map(|(_, machine)| machine)
    }

    /// Number of registered machines
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

#[async_trait]
impl MachineRegistry for InMemoryRegistry {
    async fn get(&self, id: &MachineId) -> Result<Machine, RegistryError> {
        self.machines
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    async fn set_status(&self, id: &MachineId, status: MachineStatus) -> Result<(), RegistryError> {
        let mut entry = self
            .machines
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if entry.status != status {
            tracing::debug!("Machine {} status {} -> {}", id, entry.status, status);
        }
        entry.status = status;
        entry.updated_at = current_time_millis();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Machine>, RegistryError> {
        let mut machines: Vec<Machine> = self
            .machines
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(machines)
    }
}

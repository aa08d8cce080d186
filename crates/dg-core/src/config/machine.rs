//! Machine profile configuration

use serde::{Deserialize, Serialize};

use crate::types::{Credentials, Machine, MachineId, OsType, Secret};

fn default_port() -> u16 {
    3389
}

/// Profile for a machine seeded into the registry at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Display name (defaults to the profile key)
    #[serde(default)]
    pub name: Option<String>,

    /// Hostname or address of the remote desktop server
    pub host: String,

    /// Remote desktop port
    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub password: Secret,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub os_type: OsType,

    /// Notes/description for this machine
    #[serde(default)]
    pub description: Option<String>,

    /// Connection already provisioned on the gateway
    #[serde(default)]
    pub gateway_connection_id: Option<String>,
}

impl MachineProfile {
    /// Create a profile with the default port and OS
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Build the registry record for this profile
    pub fn to_machine(&self, id: &str) -> Machine {
        let mut machine = Machine::new(
            MachineId::new(id),
            self.host.clone(),
            Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
                domain: self.domain.clone(),
            },
        );
        machine.name = self.name.clone().unwrap_or_else(|| id.to_string());
        machine.port = self.port;
        machine.os_type = self.os_type;
        machine.description = self.description.clone();
        machine.gateway_connection_id = self.gateway_connection_id.clone();
        machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineStatus;

    #[test]
    fn test_profile_to_machine() {
        let mut profile = MachineProfile::new("10.1.1.1", "bob", "pw");
        profile.domain = Some("LAB".to_string());
        profile.os_type = OsType::Linux;

        let machine = profile.to_machine("lab-1");
        assert_eq!(machine.id, MachineId::new("lab-1"));
        assert_eq!(machine.name, "lab-1");
        assert_eq!(machine.port, 3389);
        assert_eq!(machine.credentials.domain.as_deref(), Some("LAB"));
        assert_eq!(machine.status, MachineStatus::Inactive);
    }
}

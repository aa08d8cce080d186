//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a registered machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    /// Create a new machine ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Advertised availability of a machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// No session is using the machine
    #[default]
    Inactive,
    /// A session is authenticating or opening its tunnel
    Connecting,
    /// A session is connected
    Active,
    /// The last session ended in a failure
    Error,
}

impl MachineStatus {
    /// Whether this status claims a session is using the machine
    pub fn is_busy(&self) -> bool {
        matches!(self, MachineStatus::Connecting | MachineStatus::Active)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Inactive => write!(f, "inactive"),
            MachineStatus::Connecting => write!(f, "connecting"),
            MachineStatus::Active => write!(f, "active"),
            MachineStatus::Error => write!(f, "error"),
        }
    }
}

/// Operating system of a registered machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Windows,
    Linux,
    Macos,
}

/// A string that must never appear in logs
///
/// `Debug` and `Display` print `***`; use [`Secret::expose`] at the
/// single point where the value goes on the wire.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext value
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Login credentials for the remote desktop on a machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A registered machine
///
/// Only `status` is ever written by the session broker; every other
/// field belongs to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: MachineId,
    /// Display name
    pub name: String,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub os_type: OsType,
    pub description: Option<String>,
    /// Connection identifier already provisioned on the gateway, if any
    pub gateway_connection_id: Option<String>,
    pub status: MachineStatus,
    /// Creation time (ms since UNIX epoch)
    pub created_at: u64,
    /// Last modification time (ms since UNIX epoch)
    pub updated_at: u64,
}

impl Machine {
    /// Create an inactive machine record with the default RDP port
    pub fn new(
        id: impl Into<MachineId>,
        host: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let id = id.into();
        let now = crate::time::current_time_millis();
        Self {
            name: id.to_string(),
            id,
            host: host.into(),
            port: 3389,
            credentials,
            os_type: OsType::default(),
            description: None,
            gateway_connection_id: None,
            status: MachineStatus::Inactive,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Presentation view of a machine, without credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub id: MachineId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub os_type: OsType,
    pub description: Option<String>,
    pub status: MachineStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&Machine> for MachineSummary {
    fn from(machine: &Machine) -> Self {
        Self {
            id: machine.id.clone(),
            name: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            os_type: machine.os_type,
            description: machine.description.clone(),
            status: machine.status,
            created_at: machine.created_at,
            updated_at: machine.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_status_display_and_serde() {
        assert_eq!(format!("{}", MachineStatus::Active), "active");
        assert_eq!(
            serde_json::to_string(&MachineStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        assert!(MachineStatus::Connecting.is_busy());
        assert!(!MachineStatus::Error.is_busy());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: Secret::new("hunter2"),
            domain: Some("CORP".to_string()),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_summary_omits_credentials() {
        let machine = Machine::new(
            "m1",
            "10.0.0.5",
            Credentials {
                username: "admin".to_string(),
                password: Secret::new("hunter2"),
                domain: None,
            },
        );
        let json = serde_json::to_string(&MachineSummary::from(&machine)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("admin"));
        assert!(json.contains("\"status\":\"inactive\""));
        assert!(json.contains("\"port\":3389"));
    }
}

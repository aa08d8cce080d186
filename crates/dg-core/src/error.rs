//! Core error types for deskgate

use std::path::PathBuf;
use thiserror::Error;

use crate::types::MachineId;
use dg_protocol::ProtocolError;

/// Machine registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No machine with this ID
    #[error("Machine not found: {0}")]
    NotFound(MachineId),

    /// Registry store failed
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Errors talking to the remote-access gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Gateway rejected the credentials or the token
    #[error("Gateway rejected credentials: {0}")]
    Rejected(String),

    /// Gateway could not be reached
    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    /// Gateway answered with an unexpected HTTP status
    #[error("Gateway returned HTTP {status}")]
    Http { status: u16 },

    /// Tunnel transport error
    #[error("Tunnel transport error: {0}")]
    Transport(String),

    /// Tunnel did not complete the remote desktop handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Gateway reported an error on the tunnel
    #[error("Gateway error {code:#06x}: {message}")]
    Fault { code: u32, message: String },

    /// Tunnel closed by the peer
    #[error("Tunnel closed")]
    Closed,

    /// Protocol error on the tunnel
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl GatewayError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Unreachable(_)
            | GatewayError::Transport(_)
            | GatewayError::Handshake(_) => true,
            GatewayError::Http { status } => *status >= 500,
            // Upstream (0x02xx) status codes describe the remote desktop
            // server being busy or unreachable from the gateway
            GatewayError::Fault { code, .. } => (0x0200..0x0300).contains(code),
            GatewayError::Rejected(_) | GatewayError::Closed | GatewayError::Protocol(_) => false,
        }
    }

    /// Whether the gateway refused the token itself
    pub fn is_token_rejection(&self) -> bool {
        match self {
            GatewayError::Rejected(_) => true,
            GatewayError::Http { status } => *status == 401 || *status == 403,
            // CLIENT_UNAUTHORIZED / CLIENT_FORBIDDEN
            GatewayError::Fault { code, .. } => *code == 0x0301 || *code == 0x0303,
            _ => false,
        }
    }
}

/// Session-level error taxonomy surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A live session already uses this machine
    #[error("Machine {0} already has a live session")]
    AlreadyConnected(MachineId),

    /// Gateway rejected credentials or stayed unreachable past the retry budget
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Tunnel could not be established
    #[error("Tunnel failed: {0}")]
    TunnelFailure(String),

    /// Fatal error on an established session
    #[error("Protocol fault: {0}")]
    ProtocolFault(String),

    /// Referenced ID does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry error while creating the session
    #[error("Registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => SessionError::NotFound(format!("machine {}", id)),
            other => SessionError::Registry(other),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

//! Remote-access gateway traits

use async_trait::async_trait;

use crate::config::DisplaySize;
use crate::error::GatewayError;
use crate::token::AuthToken;
use crate::types::{Credentials, Machine, MachineId};
use dg_protocol::{Instruction, SessionId};

/// What the gateway needs to reach a machine
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub machine_id: MachineId,
    pub name: String,
    /// Remote desktop protocol spoken by the gateway to the machine
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Connection already provisioned on the gateway
    pub gateway_connection_id: Option<String>,
}

impl From<&Machine> for ConnectionDescriptor {
    fn from(machine: &Machine) -> Self {
        Self {
            machine_id: machine.id.clone(),
            name: machine.name.clone(),
            protocol: "rdp".to_string(),
            host: machine.host.clone(),
            port: machine.port,
            credentials: machine.credentials.clone(),
            gateway_connection_id: machine.gateway_connection_id.clone(),
        }
    }
}

/// Everything a connector needs to open one session's tunnel
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub session_id: SessionId,
    pub descriptor: ConnectionDescriptor,
    pub display: DisplaySize,
}

/// Gateway authentication endpoint
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Perform one login round-trip
    async fn request_token(&self) -> Result<AuthToken, GatewayError>;
}

/// Opens tunnels to the gateway
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Establish the transport. The remote desktop handshake is
    /// acknowledged later through [`Tunnel::recv`].
    async fn connect(
        &self,
        token: &AuthToken,
        request: &TunnelRequest,
    ) -> Result<Box<dyn Tunnel>, GatewayError>;
}

/// A bidirectional instruction stream owned by exactly one session
#[async_trait]
pub trait Tunnel: Send {
    /// Send one instruction
    async fn send(&mut self, instruction: Instruction) -> Result<(), GatewayError>;

    /// Receive the next instruction; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future loses no instruction.
    async fn recv(&mut self) -> Result<Option<Instruction>, GatewayError>;

    /// Close the transport and release gateway-side resources
    async fn close(&mut self) -> Result<(), GatewayError>;
}

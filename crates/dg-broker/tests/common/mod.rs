//! Scripted in-process gateway shared by the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dg_broker::session::SessionState;
use dg_broker::ConnectionBroker;
use dg_core::config::{BackoffConfig, SessionConfig};
use dg_core::traits::{MachineRegistry, TokenEndpoint, Tunnel, TunnelConnector, TunnelRequest};
use dg_core::{
    AuthToken, Credentials, GatewayError, InMemoryRegistry, Machine, MachineId, MachineStatus,
    RegistryError, Secret,
};
use dg_broker::gateway::GatewayAuthClient;
use dg_protocol::{Instruction, SessionId};

/// How the scripted gateway answers logins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Accept,
    Reject,
    Unreachable,
}

/// How the scripted gateway answers tunnel requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Send the tunnel uuid and `ready` at once
    Ready,
    /// Accept the transport but never acknowledge the handshake
    Silent,
    /// Refuse the transport
    Refuse,
    /// Acknowledge the handshake, then lose the transport
    ReadyThenLost,
}

/// One tunnel opened by the scripted gateway
pub struct TunnelRecord {
    pub session_id: SessionId,
    pub sent: Arc<Mutex<Vec<Instruction>>>,
    to_client: Mutex<Option<mpsc::UnboundedSender<Instruction>>>,
    pub closed: Arc<AtomicBool>,
}

impl TunnelRecord {
    pub fn sent(&self) -> Vec<Instruction> {
        self.sent.lock().unwrap().clone()
    }

    pub fn push(&self, instruction: Instruction) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(instruction);
        }
    }

    /// Drop the gateway side of the transport without a `disconnect`
    pub fn cut(&self) {
        self.to_client.lock().unwrap().take();
    }
}

pub struct MockGateway {
    auth_mode: Mutex<AuthMode>,
    tunnel_mode: Mutex<TunnelMode>,
    /// Tunnel sends block forever once set
    stall_sends: Arc<AtomicBool>,
    pub token_calls: AtomicU32,
    pub connect_calls: AtomicU32,
    tunnels: Mutex<Vec<Arc<TunnelRecord>>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auth_mode: Mutex::new(AuthMode::Accept),
            tunnel_mode: Mutex::new(TunnelMode::Ready),
            stall_sends: Arc::new(AtomicBool::new(false)),
            token_calls: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            tunnels: Mutex::new(Vec::new()),
        })
    }

    pub fn set_auth(&self, mode: AuthMode) {
        *self.auth_mode.lock().unwrap() = mode;
    }

    pub fn set_tunnel(&self, mode: TunnelMode) {
        *self.tunnel_mode.lock().unwrap() = mode;
    }

    pub fn stall_sends(&self) {
        self.stall_sends.store(true, Ordering::SeqCst);
    }

    pub fn tunnel_for(&self, session_id: SessionId) -> Option<Arc<TunnelRecord>> {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl TokenEndpoint for MockGateway {
    async fn request_token(&self) -> Result<AuthToken, GatewayError> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst);
        match *self.auth_mode.lock().unwrap() {
            AuthMode::Accept => Ok(AuthToken::new(
                format!("token-{}", n),
                "guacadmin",
                "postgresql",
                Duration::from_secs(3600),
            )),
            AuthMode::Reject => Err(GatewayError::Rejected("invalid credentials".into())),
            AuthMode::Unreachable => Err(GatewayError::Unreachable("connection refused".into())),
        }
    }
}

#[async_trait]
impl TunnelConnector for MockGateway {
    async fn connect(
        &self,
        _token: &AuthToken,
        request: &TunnelRequest,
    ) -> Result<Box<dyn Tunnel>, GatewayError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.tunnel_mode.lock().unwrap();
        if mode == TunnelMode::Refuse {
            return Err(GatewayError::Unreachable("tunnel refused".into()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        if matches!(mode, TunnelMode::Ready | TunnelMode::ReadyThenLost) {
            let uuid = format!("tunnel-{}", request.session_id.as_u32());
            let _ = to_client.send(Instruction::new("", [uuid]));
            let _ = to_client.send(Instruction::new("ready", ["$conn"]));
        }

        let tunnel = Arc::new(TunnelRecord {
            session_id: request.session_id,
            sent: Arc::new(Mutex::new(Vec::new())),
            to_client: Mutex::new(Some(to_client)),
            closed: Arc::new(AtomicBool::new(false)),
        });
        self.tunnels.lock().unwrap().push(Arc::clone(&tunnel));
        if mode == TunnelMode::ReadyThenLost {
            tunnel.cut();
        }

        Ok(Box::new(MockTunnel {
            incoming,
            sent: Arc::clone(&tunnel.sent),
            closed: Arc::clone(&tunnel.closed),
            stall_sends: Arc::clone(&self.stall_sends),
        }))
    }
}

struct MockTunnel {
    incoming: mpsc::UnboundedReceiver<Instruction>,
    sent: Arc<Mutex<Vec<Instruction>>>,
    closed: Arc<AtomicBool>,
    stall_sends: Arc<AtomicBool>,
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn send(&mut self, instruction: Instruction) -> Result<(), GatewayError> {
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.sent.lock().unwrap().push(instruction);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Instruction>, GatewayError> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry whose status writes take a while, like any store doing I/O
pub struct SlowRegistry {
    inner: Arc<InMemoryRegistry>,
    delay: Duration,
}

#[async_trait]
impl MachineRegistry for SlowRegistry {
    async fn get(&self, id: &MachineId) -> Result<Machine, RegistryError> {
        self.inner.get(id).await
    }

    async fn set_status(&self, id: &MachineId, status: MachineStatus) -> Result<(), RegistryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_status(id, status).await
    }

    async fn list(&self) -> Result<Vec<Machine>, RegistryError> {
        self.inner.list().await
    }
}

pub struct Harness {
    pub registry: Arc<InMemoryRegistry>,
    pub gateway: Arc<MockGateway>,
    pub broker: Arc<ConnectionBroker>,
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        handshake_timeout: Duration::from_millis(300),
        close_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(session_config())
    }

    pub fn with_config(session: SessionConfig) -> Self {
        Self::build(session, fast_backoff(), None)
    }

    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        Self::build(session_config(), backoff, None)
    }

    /// Harness whose registry status writes each take `delay`
    pub fn with_registry_delay(delay: Duration) -> Self {
        Self::build(session_config(), fast_backoff(), Some(delay))
    }

    fn build(session: SessionConfig, backoff: BackoffConfig, delay: Option<Duration>) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        for id in ["m1", "m2"] {
            registry.insert(Machine::new(
                id,
                "10.0.0.5",
                Credentials {
                    username: "admin".to_string(),
                    password: Secret::new("hunter2"),
                    domain: None,
                },
            ));
        }

        let gateway = MockGateway::new();
        let auth = Arc::new(GatewayAuthClient::new(
            Arc::clone(&gateway) as Arc<dyn TokenEndpoint>,
            backoff.clone(),
            session.max_attempts,
            Duration::from_secs(30),
        ));
        let store: Arc<dyn MachineRegistry> = match delay {
            Some(delay) => Arc::new(SlowRegistry {
                inner: Arc::clone(&registry),
                delay,
            }),
            None => Arc::clone(&registry) as Arc<dyn MachineRegistry>,
        };
        let broker = Arc::new(ConnectionBroker::new(
            store,
            auth,
            Arc::clone(&gateway) as Arc<dyn TunnelConnector>,
            session,
            backoff,
        ));

        Self {
            registry,
            gateway,
            broker,
        }
    }

    pub async fn status(&self, id: &str) -> MachineStatus {
        self.registry
            .get(&MachineId::new(id))
            .await
            .unwrap()
            .status
    }

    /// Wait until the session reaches `state`
    pub async fn wait_for(&self, id: SessionId, state: SessionState) {
        let handle = self.broker.table().get(id).expect("session exists");
        let mut status = handle.subscribe().status;
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}", id, state))
            .expect("session handle alive");
    }

    /// Wait until the machine is released by its session
    pub async fn wait_released(&self, id: &str) {
        let machine = MachineId::new(id);
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.broker.table().live_for(&machine).is_some() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never released", id));
    }

    /// Wait until the tunnel has recorded `count` instructions matching `filter`
    pub async fn wait_sent<F>(&self, id: SessionId, count: usize, filter: F) -> Vec<Instruction>
    where
        F: Fn(&Instruction) -> bool,
    {
        let tunnel = self.gateway.tunnel_for(id).expect("tunnel opened");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let matching: Vec<Instruction> =
                    tunnel.sent().into_iter().filter(|i| filter(i)).collect();
                if matching.len() >= count {
                    return matching;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("instructions reached the gateway")
    }
}

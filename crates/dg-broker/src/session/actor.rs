//! Per-session actor
//!
//! One task per session. It owns the tunnel exclusively and drives the
//! session from `pending` to a terminal state:
//!
//! 1. authenticate (shared token, retried by the auth client)
//! 2. open the tunnel and wait for the handshake ack, with bounded retries
//! 3. relay input to the gateway and output to subscribers
//! 4. tear down: drain queued input on user close, send `disconnect`,
//!    close the tunnel, write the terminal machine status
//!
//! Cancellation is observed at every suspension point so a close request
//! interrupts the session in any state.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use dg_core::config::{BackoffConfig, SessionConfig};
use dg_core::traits::{Tunnel, TunnelConnector, TunnelRequest};
use dg_core::{AuthToken, GatewayError};
use dg_protocol::{opcode, InputEvent, Instruction, PointerState};

use super::handle::SessionHandle;
use super::state::{SessionState, TerminationCause};
use super::status::StatusPropagator;
use crate::gateway::{GatewayAuthClient, RetryBackoff};

/// Collaborators shared by every session actor
pub struct SessionContext {
    pub auth: Arc<GatewayAuthClient>,
    pub connector: Arc<dyn TunnelConnector>,
    pub propagator: Arc<StatusPropagator>,
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
}

/// How a phase of the session ended early
enum Exit {
    /// Close was requested
    Cancelled,
    /// The session ended on its own
    Terminated(TerminationCause),
}

pub struct SessionActor {
    handle: Arc<SessionHandle>,
    ctx: Arc<SessionContext>,
    request: TunnelRequest,
    input_rx: mpsc::Receiver<InputEvent>,
    cancel: CancellationToken,
}

impl SessionActor {
    pub fn new(
        handle: Arc<SessionHandle>,
        ctx: Arc<SessionContext>,
        request: TunnelRequest,
        input_rx: mpsc::Receiver<InputEvent>,
    ) -> Self {
        let cancel = handle.cancel_token();
        Self {
            handle,
            ctx,
            request,
            input_rx,
            cancel,
        }
    }

    /// Spawn the actor and attach its task to the session handle
    pub fn spawn(self) {
        let handle = Arc::clone(&self.handle);
        let task = tokio::spawn(self.run());
        handle.attach_task(task);
    }

    pub async fn run(mut self) {
        let id = self.handle.id;
        tracing::info!("{} starting for machine {}", id, self.handle.machine_id);

        let tunnel = match self.connect().await {
            Ok(tunnel) => tunnel,
            Err(Exit::Cancelled) => {
                self.close_unconnected().await;
                return;
            }
            Err(Exit::Terminated(cause)) => {
                self.handle.record_cause(cause.clone());
                self.ctx
                    .propagator
                    .finish(&self.handle, SessionState::Failed, cause)
                    .await;
                return;
            }
        };

        self.serve(tunnel).await;
        tracing::debug!("{} actor exiting", id);
    }

    /// Authenticate and open the tunnel
    async fn connect(&mut self) -> Result<Box<dyn Tunnel>, Exit> {
        let propagator = Arc::clone(&self.ctx.propagator);
        if !propagator
            .advance(&self.handle, SessionState::Authenticating)
            .await
        {
            return Err(Exit::Cancelled);
        }

        let token = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
            result = self.ctx.auth.token() => result.map_err(|e| {
                tracing::warn!("{} authentication failed: {}", self.handle.id, e);
                Exit::Terminated(TerminationCause::AuthFailure(e.to_string()))
            })?,
        };

        if !propagator
            .advance(&self.handle, SessionState::Tunneling)
            .await
        {
            return Err(Exit::Cancelled);
        }

        let tunnel = self.open_tunnel(token).await?;

        if !propagator
            .advance(&self.handle, SessionState::Connected)
            .await
        {
            let mut tunnel = tunnel;
            close_quietly(&mut *tunnel).await;
            return Err(Exit::Cancelled);
        }
        tracing::info!(
            "{} connected to {} (tunnel {})",
            self.handle.id,
            self.handle.machine_id,
            self.handle.connection_handle().unwrap_or("-")
        );
        Ok(tunnel)
    }

    /// Open the tunnel with bounded retries. A token the gateway refuses
    /// is dropped from the shared cache and replaced before the next attempt.
    async fn open_tunnel(&self, mut token: AuthToken) -> Result<Box<dyn Tunnel>, Exit> {
        let mut backoff = RetryBackoff::from_config(&self.ctx.backoff, self.ctx.session.max_attempts);

        loop {
            let error = match self.attempt_tunnel(&token).await? {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => e,
            };

            let rejected = error.is_token_rejection();
            if !rejected && !error.is_retryable() {
                tracing::warn!("{} tunnel failed: {}", self.handle.id, error);
                return Err(Exit::Terminated(TerminationCause::TunnelFailure(
                    error.to_string(),
                )));
            }
            let Some(delay) = backoff.next_delay() else {
                tracing::warn!(
                    "{} tunnel failed after {} attempts: {}",
                    self.handle.id,
                    backoff.attempts_made(),
                    error
                );
                return Err(Exit::Terminated(TerminationCause::TunnelFailure(
                    error.to_string(),
                )));
            };
            tracing::warn!(
                "{} tunnel attempt {} failed: {}. Retrying in {:?}",
                self.handle.id,
                backoff.attempts_made() - 1,
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            if rejected {
                self.ctx.auth.invalidate(&token).await;
                token = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                    result = self.ctx.auth.token() => result.map_err(|e| {
                        Exit::Terminated(TerminationCause::AuthFailure(e.to_string()))
                    })?,
                };
            }
        }
    }

    /// One connect-and-handshake attempt within the handshake timeout.
    ///
    /// The outer error means the attempt was interrupted; the inner one
    /// is a gateway failure the caller may retry.
    async fn attempt_tunnel(
        &self,
        token: &AuthToken,
    ) -> Result<Result<Box<dyn Tunnel>, GatewayError>, Exit> {
        let deadline = Instant::now() + self.ctx.session.handshake_timeout;

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
            result = timeout_at(deadline, self.ctx.connector.connect(token, &self.request)) => result,
        };
        let mut tunnel = match connected {
            Ok(Ok(tunnel)) => tunnel,
            Ok(Err(e)) => return Ok(Err(e)),
            Err(_) => {
                return Ok(Err(GatewayError::Handshake(
                    "tunnel connect timed out".to_string(),
                )))
            }
        };

        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = timeout_at(deadline, await_handshake(&self.handle, &mut *tunnel)) => Some(result),
        };
        match handshake {
            Some(Ok(Ok(()))) => Ok(Ok(tunnel)),
            Some(Ok(Err(e))) => {
                close_quietly(&mut *tunnel).await;
                Ok(Err(e))
            }
            Some(Err(_)) => {
                close_quietly(&mut *tunnel).await;
                Ok(Err(GatewayError::Handshake(format!(
                    "no handshake ack within {:?}",
                    self.ctx.session.handshake_timeout
                ))))
            }
            None => {
                close_quietly(&mut *tunnel).await;
                Err(Exit::Cancelled)
            }
        }
    }

    /// Close requested before the tunnel was up
    async fn close_unconnected(&mut self) {
        self.input_rx.close();
        let propagator = &self.ctx.propagator;
        propagator
            .advance(&self.handle, SessionState::Disconnecting)
            .await;
        propagator
            .finish(&self.handle, SessionState::Closed, TerminationCause::UserClose)
            .await;
    }

    /// Relay until the session ends, then tear down
    async fn serve(&mut self, mut tunnel: Box<dyn Tunnel>) {
        let mut pointer = PointerState::default();
        let exit = self.relay(&mut *tunnel, &mut pointer).await;

        let cause = match exit {
            Exit::Cancelled => self.handle.cause().unwrap_or(TerminationCause::UserClose),
            Exit::Terminated(cause) => {
                self.handle.record_cause(cause.clone());
                cause
            }
        };

        self.ctx
            .propagator
            .advance(&self.handle, SessionState::Disconnecting)
            .await;
        self.input_rx.close();

        match cause {
            TerminationCause::UserClose => {
                // Input accepted before the close still reaches the gateway
                while let Ok(event) = self.input_rx.try_recv() {
                    if let Err(e) = forward(&mut *tunnel, &mut pointer, event).await {
                        tracing::debug!("{} dropped queued input during close: {}", self.handle.id, e);
                        break;
                    }
                }
                if let Err(e) = tunnel.send(Instruction::disconnect()).await {
                    tracing::debug!("{} disconnect not delivered: {}", self.handle.id, e);
                }
            }
            TerminationCause::Shutdown => {
                while self.input_rx.try_recv().is_ok() {}
                if let Err(e) = tunnel.send(Instruction::disconnect()).await {
                    tracing::debug!("{} disconnect not delivered: {}", self.handle.id, e);
                }
            }
            _ => while self.input_rx.try_recv().is_ok() {},
        }

        if let Err(e) = tunnel.close().await {
            tracing::warn!("{} tunnel teardown incomplete: {}", self.handle.id, e);
        }
        self.ctx
            .propagator
            .finish(&self.handle, SessionState::Closed, cause)
            .await;
    }

    async fn relay(&mut self, tunnel: &mut dyn Tunnel, pointer: &mut PointerState) -> Exit {
        let period = self
            .ctx
            .session
            .keepalive_interval
            .max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                event = self.input_rx.recv() => {
                    let Some(event) = event else { return Exit::Cancelled };
                    if let Err(e) = forward(tunnel, pointer, event).await {
                        return Exit::Terminated(transport_cause(e));
                    }
                    self.handle.touch();
                }
                received = tunnel.recv() => match received {
                    Ok(Some(instruction)) => {
                        if let Some(exit) = self.on_instruction(tunnel, instruction).await {
                            return exit;
                        }
                    }
                    Ok(None) => {
                        return Exit::Terminated(TerminationCause::TransportLost(
                            "tunnel closed without disconnect".to_string(),
                        ))
                    }
                    Err(e) => return Exit::Terminated(transport_cause(e)),
                },
                _ = keepalive.tick() => {
                    if let Err(e) = tunnel.send(Instruction::nop()).await {
                        return Exit::Terminated(transport_cause(e));
                    }
                }
            }
        }
    }

    async fn on_instruction(
        &self,
        tunnel: &mut dyn Tunnel,
        instruction: Instruction,
    ) -> Option<Exit> {
        match instruction.opcode.as_str() {
            opcode::NOP => None,
            opcode::DISCONNECT => {
                tracing::info!("{} disconnected by gateway", self.handle.id);
                Some(Exit::Terminated(TerminationCause::GatewayClosed))
            }
            opcode::ERROR => {
                let reason = match instruction.error_details() {
                    Ok((message, code)) => format!("gateway error {:#06x}: {}", code, message),
                    Err(e) => e.to_string(),
                };
                tracing::warn!("{} {}", self.handle.id, reason);
                Some(Exit::Terminated(TerminationCause::ProtocolFault(reason)))
            }
            opcode::SYNC => {
                let timestamp = instruction.first_arg().unwrap_or("0").to_string();
                if let Err(e) = tunnel.send(Instruction::sync(&timestamp)).await {
                    return Some(Exit::Terminated(transport_cause(e)));
                }
                self.publish(&instruction);
                None
            }
            opcode::INTERNAL => {
                // Internal pings are echoed unchanged
                if instruction.first_arg() == Some("ping") {
                    if let Err(e) = tunnel.send(instruction).await {
                        return Some(Exit::Terminated(transport_cause(e)));
                    }
                }
                None
            }
            _ => {
                self.publish(&instruction);
                None
            }
        }
    }

    fn publish(&self, instruction: &Instruction) {
        let mut buf = BytesMut::with_capacity(instruction.encoded_len());
        instruction.encode(&mut buf);
        self.handle.publish_output(buf.freeze());
    }
}

/// Wait for the gateway to acknowledge the remote desktop handshake
async fn await_handshake(
    handle: &SessionHandle,
    tunnel: &mut dyn Tunnel,
) -> Result<(), GatewayError> {
    loop {
        let Some(instruction) = tunnel.recv().await? else {
            return Err(GatewayError::Closed);
        };
        match instruction.opcode.as_str() {
            opcode::INTERNAL => {
                if let Some(uuid) = instruction.first_arg().filter(|a| *a != "ping") {
                    handle.set_connection_handle(uuid.to_string());
                }
            }
            opcode::READY => {
                if let Some(uuid) = instruction.first_arg() {
                    handle.set_connection_handle(uuid.to_string());
                }
                return Ok(());
            }
            opcode::SYNC => {
                let timestamp = instruction.first_arg().unwrap_or("0").to_string();
                tunnel.send(Instruction::sync(&timestamp)).await?;
                return Ok(());
            }
            opcode::ERROR => {
                let (message, code) = instruction.error_details()?;
                return Err(GatewayError::Fault { code, message });
            }
            opcode::DISCONNECT => return Err(GatewayError::Closed),
            _ => {
                tracing::trace!("{} ignoring {} before handshake ack", handle.id, instruction.opcode);
            }
        }
    }
}

/// Translate one input event and send it, in order
async fn forward(
    tunnel: &mut dyn Tunnel,
    pointer: &mut PointerState,
    event: InputEvent,
) -> Result<(), GatewayError> {
    for instruction in pointer.apply(event) {
        tunnel.send(instruction).await?;
    }
    Ok(())
}

fn transport_cause(error: GatewayError) -> TerminationCause {
    match error {
        GatewayError::Protocol(e) => TerminationCause::ProtocolFault(e.to_string()),
        GatewayError::Fault { code, message } => {
            TerminationCause::ProtocolFault(format!("gateway error {:#06x}: {}", code, message))
        }
        other => TerminationCause::TransportLost(other.to_string()),
    }
}

async fn close_quietly(tunnel: &mut dyn Tunnel) {
    if let Err(e) = tunnel.close().await {
        tracing::debug!("Tunnel close failed: {}", e);
    }
}

//! Route handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dg_core::{MachineId, MachineSummary, SessionError};
use dg_protocol::{InputEvent, SessionId};

use super::ApiError;
use crate::broker::CloseOutcome;
use crate::session::{InputDisposition, SessionEvent, SessionInfo, SessionState};
use crate::state::DaemonState;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConnectionRequest {
    pub server_id: MachineId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub id: SessionId,
    pub outcome: CloseOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputResponse {
    pub disposition: InputDisposition,
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(|_| ApiError::BadId(raw.to_string()))
}

/// `GET /api/`
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "deskgate connection broker",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /api/machines`
pub async fn list_machines(State(state): State<Arc<DaemonState>>) -> ApiResult<Vec<MachineSummary>> {
    let machines = state.registry.list().await?;
    Ok(Json(machines.iter().map(MachineSummary::from).collect()))
}

/// `GET /api/machines/:id`
pub async fn get_machine(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> ApiResult<MachineSummary> {
    let machine = state.registry.get(&MachineId::new(id)).await?;
    Ok(Json(MachineSummary::from(&machine)))
}

/// `POST /api/connections`
pub async fn create_connection(
    State(state): State<Arc<DaemonState>>,
    Json(request): Json<CreateConnectionRequest>,
) -> ApiResult<SessionInfo> {
    let info = state.broker.create(&request.server_id).await?;
    Ok(Json(info))
}

/// `GET /api/connections`
pub async fn list_connections(State(state): State<Arc<DaemonState>>) -> Json<Vec<SessionInfo>> {
    Json(state.broker.list())
}

/// `GET /api/connections/active`
pub async fn list_active_connections(
    State(state): State<Arc<DaemonState>>,
) -> Json<Vec<SessionInfo>> {
    Json(state.broker.list_active())
}

/// `GET /api/connections/:id`
pub async fn get_connection(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionInfo> {
    let id = parse_id(&id)?;
    state
        .broker
        .get(id)
        .map(Json)
        .ok_or_else(|| SessionError::NotFound(id.to_string()).into())
}

/// `GET /api/connections/:id/history`
pub async fn connection_history(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<SessionState>> {
    let id = parse_id(&id)?;
    state
        .broker
        .history(id)
        .map(Json)
        .ok_or_else(|| SessionError::NotFound(id.to_string()).into())
}

/// `DELETE /api/connections/:id`
pub async fn close_connection(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> ApiResult<CloseResponse> {
    let id = parse_id(&id)?;
    let outcome = state.broker.close(id).await;
    Ok(Json(CloseResponse { id, outcome }))
}

/// `GET /api/connections/:id/events`
///
/// Server-sent events: `status` carries the state name, `output` a JSON
/// string with the gateway payload. The stream ends after the terminal
/// state.
pub async fn connection_events(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let events = state.broker.subscribe(id)?.events().map(|event| {
        Ok(match event {
            SessionEvent::Status(state) => Event::default().event("status").data(state.to_string()),
            SessionEvent::Output(payload) => {
                let text = Value::String(String::from_utf8_lossy(&payload).into_owned());
                Event::default().event("output").data(text.to_string())
            }
        })
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `POST /api/connections/:id/input`
pub async fn send_input(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
    Json(event): Json<InputEvent>,
) -> ApiResult<InputResponse> {
    let id = parse_id(&id)?;
    event.validate()?;
    let disposition = state.broker.send_input(id, event).await?;
    Ok(Json(InputResponse { disposition }))
}

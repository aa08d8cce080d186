//! HTTP API consumed by the presentation layer
//!
//! Thin adapter over [`ConnectionBroker`](crate::broker::ConnectionBroker)
//! and the machine registry. Broker results are returned as JSON values;
//! only lookups of missing records and refused creates map to HTTP errors.

mod error;
mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::DaemonState;

pub use error::ApiError;
pub use routes::{CloseResponse, CreateConnectionRequest, InputResponse};

/// Build the API router
pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/api", get(routes::root))
        .route("/api/", get(routes::root))
        .route("/api/machines", get(routes::list_machines))
        .route("/api/machines/:id", get(routes::get_machine))
        .route(
            "/api/connections",
            get(routes::list_connections).post(routes::create_connection),
        )
        .route("/api/connections/active", get(routes::list_active_connections))
        .route(
            "/api/connections/:id",
            get(routes::get_connection).delete(routes::close_connection),
        )
        .route("/api/connections/:id/history", get(routes::connection_history))
        .route("/api/connections/:id/events", get(routes::connection_events))
        .route("/api/connections/:id/input", post(routes::send_input))
        .with_state(state)
}

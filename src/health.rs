use std::sync::Arc;

use axum::{Json, extract::State};
use serde::Serialize;

use crate::connection::ReadyState;
use crate::registry::Registry;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    status: String,
    database: String,
    connection: ReadyState,
}

pub async fn health_check(State(registry): State<Arc<Registry>>) -> Json<HealthCheckResponse> {
    let connection = registry.ready_state();
    let status = match connection {
        ReadyState::Connected => "ok",
        _ => "degraded",
    };

    Json(HealthCheckResponse {
        status: status.to_string(),
        database: registry.database_name().to_string(),
        connection,
    })
}

//! Status endpoints

use axum::{Json, extract::State as AxumState};
use serde::Serialize;

use crate::SharedState;

pub async fn root() -> &'static str {
    "couch_deploy is running"
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub name: &'static str,
    pub version: &'static str,
    pub started_at: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct DeployStatus {
    pub webhook_path: String,
    pub configured_units: usize,
    pub trigger_filename: String,
    pub restart_timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub server: ServerStatus,
    pub deploy: DeployStatus,
}

/// GET /status - Server uptime and the active trigger policy
pub async fn status(AxumState(state): AxumState<SharedState>) -> Json<StatusResponse> {
    let policy = state.deployer.policy();

    Json(StatusResponse {
        server: ServerStatus {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            started_at: state.started_at.to_rfc3339(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
        },
        deploy: DeployStatus {
            webhook_path: state.config.route_path(),
            configured_units: policy.unit_count(),
            trigger_filename: policy.trigger_filename().to_string(),
            restart_timeout_seconds: state.config.restart_timeout_secs,
        },
    })
}

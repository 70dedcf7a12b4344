use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AdminState;
use crate::supervisor::{MasterState, WorkerInfo};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub state: MasterState,
    pub generation: u64,
    pub target: usize,
    pub listening: usize,
    pub restarts: u64,
    pub reloads: u64,
}

#[derive(Serialize)]
pub struct CommandAccepted {
    pub accepted: &'static str,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.handle.snapshot();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: snapshot.state,
        generation: snapshot.generation,
        target: snapshot.target,
        listening: snapshot.listening,
        restarts: snapshot.restarts,
        reloads: snapshot.reloads,
    })
}

pub async fn get_workers(State(state): State<AdminState>) -> Json<Vec<WorkerInfo>> {
    Json(state.handle.snapshot().workers.clone())
}

pub async fn post_reload(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<CommandAccepted>), StatusCode> {
    tracing::info!(source = "admin", "Reload requested");
    accepted(state.handle.reload(), "reload")
}

pub async fn post_stop(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<CommandAccepted>), StatusCode> {
    tracing::info!(source = "admin", "Stop requested");
    accepted(state.handle.stop(), "stop")
}

fn accepted(
    delivered: bool,
    command: &'static str,
) -> Result<(StatusCode, Json<CommandAccepted>), StatusCode> {
    if delivered {
        Ok((StatusCode::ACCEPTED, Json(CommandAccepted { accepted: command })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

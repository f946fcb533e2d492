use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use framelink_core::EngineCommand;
use framelink_core::status::EngineStatus;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<EngineStatus>,
    pub commands: mpsc::Sender<EngineCommand>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/status", get(get_status))
        .route("/api/target-rate", post(set_target_rate))
        .route("/api/device", post(select_device))
        .route("/api/devices/refresh", post(refresh_devices))
        .route("/api/results/clear", post(clear_results))
        .route("/api/reconnect", post(reconnect))
        .with_state(state)
}

async fn root() -> &'static str {
    "FrameLink Agent Running"
}

async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.status.borrow().clone())
}

#[derive(Debug, Deserialize)]
pub struct TargetRateRequest {
    pub hz: u32,
}

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device_id: String,
}

async fn set_target_rate(
    State(state): State<AppState>,
    Json(request): Json<TargetRateRequest>,
) -> StatusCode {
    if request.hz == 0 {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    submit(&state, EngineCommand::SetTargetRate { hz: request.hz }).await
}

async fn select_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> StatusCode {
    submit(
        &state,
        EngineCommand::SelectDevice {
            device_id: request.device_id,
        },
    )
    .await
}

async fn refresh_devices(State(state): State<AppState>) -> StatusCode {
    submit(&state, EngineCommand::RefreshDevices).await
}

async fn clear_results(State(state): State<AppState>) -> StatusCode {
    submit(&state, EngineCommand::ClearResults).await
}

async fn reconnect(State(state): State<AppState>) -> StatusCode {
    submit(&state, EngineCommand::Reconnect).await
}

async fn submit(state: &AppState, command: EngineCommand) -> StatusCode {
    match state.commands.send(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(err) => {
            tracing::warn!(command = ?err.0, "engine no longer accepts commands");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

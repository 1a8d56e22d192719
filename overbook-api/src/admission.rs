use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use serde::Serialize;
use tracing::info;

use overbook_core::FlightId;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub flight_id: FlightId,
    pub status: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/flights/{flight_id}/admission", post(trigger_admission))
        .route("/v1/flights/{flight_id}/admission/stop", post(stop_admission))
}

async fn trigger_admission(
    State(state): State<AppState>,
    Path(flight_id): Path<FlightId>,
) -> Result<(StatusCode, Json<AdmissionResponse>), AppError> {
    // The run reports through the registry's logs; the handle is not awaited.
    let _run = state
        .registry
        .trigger(flight_id)
        .await
        .map_err(AppError::admission)?;
    info!("Admission triggered for flight {}", flight_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(AdmissionResponse {
            flight_id,
            status: "processing",
        }),
    ))
}

async fn stop_admission(
    State(state): State<AppState>,
    Path(flight_id): Path<FlightId>,
) -> Result<(StatusCode, Json<AdmissionResponse>), AppError> {
    state
        .registry
        .stop(flight_id)
        .await
        .map_err(AppError::admission)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AdmissionResponse {
            flight_id,
            status: "stopping",
        }),
    ))
}

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use overbook_admission::TriggerOutcome;
use overbook_core::FlightId;

use crate::error::AppError;
use crate::state::AppState;

const IN_PROGRESS: &str = "in_progress";

#[derive(Debug, Deserialize)]
pub struct SubmitBookingRequest {
    pub flight_id: FlightId,
    pub customer_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitBookingResponse {
    pub booking_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct BookingStatusResponse {
    pub booking_id: Uuid,
    pub status: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", post(submit_booking))
        .route("/v1/bookings/{booking_id}", get(get_booking_status))
}

async fn submit_booking(
    State(state): State<AppState>,
    Json(req): Json<SubmitBookingRequest>,
) -> Result<(StatusCode, Json<SubmitBookingResponse>), AppError> {
    let customer_id = req.customer_id.trim();
    if customer_id.is_empty() {
        return Err(AppError::ValidationError("customer_id must not be empty".to_string()));
    }

    let submission = state
        .producer
        .submit(req.flight_id, customer_id)
        .await
        .map_err(AppError::admission)?;

    match &submission.trigger {
        TriggerOutcome::Started => info!("Started admission for flight {}", req.flight_id),
        TriggerOutcome::AlreadyProcessing => {}
        // Queued requests survive; the next trigger drains them.
        TriggerOutcome::Deferred(reason) => warn!(
            "Booking {} queued without an active run: {}",
            submission.booking_id, reason
        ),
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBookingResponse {
            booking_id: submission.booking_id,
            status: "queued",
        }),
    ))
}

async fn get_booking_status(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingStatusResponse>, AppError> {
    if let Some(cache) = &state.status_cache {
        match cache.redis.get_cached_status(booking_id).await {
            Ok(Some(status)) => return Ok(Json(BookingStatusResponse { booking_id, status })),
            Ok(None) => {}
            Err(e) => warn!("Status cache read failed for {}: {}", booking_id, e),
        }
    }

    let booking = state
        .registry
        .processor()
        .store()
        .get(booking_id)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    let status = match booking {
        Some(booking) => {
            // Decided statuses never change, so they are safe to cache.
            if let Some(cache) = &state.status_cache {
                if let Err(e) = cache
                    .redis
                    .cache_status(booking_id, booking.status, cache.ttl_seconds)
                    .await
                {
                    warn!("Status cache write failed for {}: {}", booking_id, e);
                }
            }
            booking.status.as_str().to_string()
        }
        None => IN_PROGRESS.to_string(),
    };

    Ok(Json(BookingStatusResponse { booking_id, status }))
}

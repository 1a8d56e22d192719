use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::flight::FlightId;

/// Caller-assigned idempotency key.
pub type BookingId = Uuid;

/// Payload carried on a flight's request queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub booking_id: BookingId,
    pub customer_id: String,
}

impl BookingRequest {
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            booking_id: Uuid::new_v4(),
            customer_id: customer_id.into(),
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Booked,
    Oversold,
    Failed,
}

impl BookingStatus {
    /// Whether this outcome consumed a seat.
    pub fn takes_seat(&self) -> bool {
        matches!(self, BookingStatus::Booked | BookingStatus::Oversold)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Oversold => "oversold",
            BookingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booked" => Ok(BookingStatus::Booked),
            "oversold" => Ok(BookingStatus::Oversold),
            "failed" => Ok(BookingStatus::Failed),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

/// Persisted admission outcome, written once per consumed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer_id: String,
    pub flight_id: FlightId,
    pub status: BookingStatus,
}

impl Booking {
    pub fn from_request(request: &BookingRequest, flight_id: FlightId, status: BookingStatus) -> Self {
        Self {
            id: request.booking_id,
            customer_id: request.customer_id.clone(),
            flight_id,
            status,
        }
    }
}

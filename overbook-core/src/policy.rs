use serde::{Deserialize, Serialize};

use crate::booking::BookingStatus;
use crate::flight::Flight;

/// Running seat counter for one flight, seeded once from the ledger and
/// mutated only by the lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCounter {
    pub booking_limit: i32,
    pub oversell_limit: i32,
    pub current_booking: i32,
}

impl CapacityCounter {
    pub fn from_flight(flight: &Flight) -> Self {
        Self {
            booking_limit: flight.booking_limit,
            oversell_limit: flight.oversell_limit,
            current_booking: flight.current_booking,
        }
    }

    /// Status the next request would get, without consuming a seat.
    pub fn classify(&self) -> BookingStatus {
        if self.current_booking < self.booking_limit {
            BookingStatus::Booked
        } else if self.current_booking < self.oversell_limit {
            BookingStatus::Oversold
        } else {
            BookingStatus::Failed
        }
    }

    /// Applies a decision once its record is durable.
    pub fn commit(&mut self, status: BookingStatus) {
        if status.takes_seat() {
            self.current_booking += 1;
        }
    }

    /// Classify and commit in one step.
    pub fn admit(&mut self) -> BookingStatus {
        let status = self.classify();
        self.commit(status);
        status
    }

    pub fn is_full(&self) -> bool {
        self.current_booking >= self.oversell_limit
    }
}

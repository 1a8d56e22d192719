use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type FlightId = i64;

/// A flight row as held by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flight {
    pub id: FlightId,
    pub origin: String,
    pub destination: String,
    pub flight_date: NaiveDate,
    pub price: f64,
    /// Seats sellable without being marked oversold.
    pub booking_limit: i32,
    /// Hard ceiling including oversold seats.
    pub oversell_limit: i32,
    /// Booked plus oversold so far.
    pub current_booking: i32,
}

impl Flight {
    /// Checks `0 <= current_booking <= oversell_limit` and `booking_limit <= oversell_limit`.
    pub fn validate(&self) -> Result<(), String> {
        if self.booking_limit < 0 {
            return Err(format!("booking_limit {} is negative", self.booking_limit));
        }
        if self.booking_limit > self.oversell_limit {
            return Err(format!(
                "booking_limit {} exceeds oversell_limit {}",
                self.booking_limit, self.oversell_limit
            ));
        }
        if self.current_booking < 0 || self.current_booking > self.oversell_limit {
            return Err(format!(
                "current_booking {} outside 0..={}",
                self.current_booking, self.oversell_limit
            ));
        }
        Ok(())
    }

    pub fn remaining_seats(&self) -> i32 {
        (self.oversell_limit - self.current_booking).max(0)
    }
}

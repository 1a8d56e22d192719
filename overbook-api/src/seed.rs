use chrono::NaiveDate;
use overbook_core::Flight;

/// Flight loaded into the in-memory ledger when no database is configured.
pub fn demo_flight() -> Option<Flight> {
    Some(Flight {
        id: 1,
        origin: "JFK".to_string(),
        destination: "LHR".to_string(),
        flight_date: NaiveDate::from_ymd_opt(2025, 1, 1)?,
        price: 420.0,
        booking_limit: 100,
        oversell_limit: 110,
        current_booking: 0,
    })
}

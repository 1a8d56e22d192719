use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;

use overbook_core::repository::{FlightLedger, LedgerError};
use overbook_core::{Flight, FlightId};

#[derive(sqlx::FromRow)]
struct FlightRow {
    id: i64,
    origin: String,
    destination: String,
    flight_date: NaiveDate,
    price: f64,
    booking_limit: i32,
    oversell_limit: i32,
    current_booking: i32,
}

impl From<FlightRow> for Flight {
    fn from(row: FlightRow) -> Self {
        Flight {
            id: row.id,
            origin: row.origin,
            destination: row.destination,
            flight_date: row.flight_date,
            price: row.price,
            booking_limit: row.booking_limit,
            oversell_limit: row.oversell_limit,
            current_booking: row.current_booking,
        }
    }
}

fn backend(e: sqlx::Error) -> LedgerError {
    LedgerError::Backend(e.to_string())
}

/// Flight ledger over the `flights` table.
pub struct PostgresFlightLedger {
    pub pool: PgPool,
}

impl PostgresFlightLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlightLedger for PostgresFlightLedger {
    async fn get_flight(&self, flight_id: FlightId) -> Result<Flight, LedgerError> {
        let row = sqlx::query_as::<_, FlightRow>(
            r#"
            SELECT id, origin, destination, flight_date, price,
                   booking_limit, oversell_limit, current_booking
            FROM flights
            WHERE id = $1
            "#,
        )
        .bind(flight_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Flight::from).ok_or(LedgerError::NotFound(flight_id))
    }

    async fn update_counter(&self, flight_id: FlightId, current_booking: i32) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE flights SET current_booking = $2 WHERE id = $1")
            .bind(flight_id)
            .bind(current_booking)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(flight_id));
        }
        Ok(())
    }

    async fn compare_and_set_counter(
        &self,
        flight_id: FlightId,
        expected: i32,
        current_booking: i32,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE flights SET current_booking = $3 WHERE id = $1 AND current_booking = $2",
        )
        .bind(flight_id)
        .bind(expected)
        .bind(current_booking)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing matched: either the row is gone or someone else moved the counter.
        let actual: Option<i32> = sqlx::query_scalar("SELECT current_booking FROM flights WHERE id = $1")
            .bind(flight_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match actual {
            Some(actual) => Err(LedgerError::Diverged {
                flight_id,
                expected,
                actual,
            }),
            None => Err(LedgerError::NotFound(flight_id)),
        }
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use overbook_core::repository::{BookingStore, StoreError};
use overbook_core::{Booking, BookingId};

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    customer_id: String,
    flight_id: i64,
    status: String,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            customer_id: row.customer_id,
            flight_id: row.flight_id,
            status: row.status.parse().map_err(StoreError::Backend)?,
        })
    }
}

/// Booking records keyed by booking id; the primary key is the idempotency guard.
pub struct PostgresBookingStore {
    pub pool: PgPool,
}

impl PostgresBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PostgresBookingStore {
    async fn put(&self, booking: &Booking) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bookings (id, customer_id, flight_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(booking.id)
        .bind(&booking.customer_id)
        .bind(booking.flight_id)
        .bind(booking.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(booking.id));
        }
        Ok(())
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id, customer_id, flight_id, status FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.map(Booking::try_from).transpose()
    }
}

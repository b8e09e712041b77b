//! Read model documents in the `read_model_ops_bookings` table.
//!
//! ```sql
//! CREATE TABLE read_model_ops_bookings (
//!     booking_id UUID PRIMARY KEY,
//!     payload    JSONB NOT NULL
//! );
//! ```

use super::{BookingMerge, OpsBooking, OpsBookingStore, ReadModelError, TicketMerge};
use crate::types::{BookingId, TicketId};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{PgConnection, PgPool};
use tickets_postgres::{DEFAULT_CONFLICT_ATTEMPTS, IsolationLevel, begin, retry_on_conflict};

const RECEIPT_DATE_FILTER: &str = r"
    SELECT payload FROM read_model_ops_bookings
    WHERE booking_id IN (
        SELECT booking_id FROM (
            SELECT booking_id,
                DATE((jsonb_path_query(payload, '$.tickets.*.receipt_issued_at') #>> '{}')::timestamptz) AS receipt_issued_at
            FROM read_model_ops_bookings
        ) bookings_within_date
        WHERE receipt_issued_at = $1
    )
    ORDER BY booking_id
";

/// Read model store over `pool`.
#[derive(Debug, Clone)]
pub struct PostgresOpsBookings {
    pool: PgPool,
}

impl PostgresOpsBookings {
    /// Creates a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn persist(conn: &mut PgConnection, mut booking: OpsBooking) -> Result<OpsBooking, ReadModelError> {
        booking.last_update = Utc::now();
        sqlx::query(
            r"
            INSERT INTO read_model_ops_bookings (booking_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (booking_id) DO UPDATE SET payload = excluded.payload
            ",
        )
        .bind(booking.booking_id.as_uuid())
        .bind(serde_json::to_value(&booking)?)
        .execute(conn)
        .await?;
        Ok(booking)
    }

    async fn try_update_booking(
        &self,
        booking_id: BookingId,
        merge: BookingMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        let mut tx = begin(&self.pool, IsolationLevel::RepeatableRead).await?;

        let payload: serde_json::Value =
            sqlx::query_scalar("SELECT payload FROM read_model_ops_bookings WHERE booking_id = $1")
                .bind(booking_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| ReadModelError::NotReady(format!("booking {booking_id} not created yet")))?;

        let mut booking: OpsBooking = serde_json::from_value(payload)?;
        merge(&mut booking);
        let booking = Self::persist(&mut *tx, booking).await?;
        tx.commit().await?;
        Ok(booking)
    }

    async fn try_update_ticket(
        &self,
        ticket_id: TicketId,
        merge: TicketMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        let mut tx = begin(&self.pool, IsolationLevel::RepeatableRead).await?;

        let payload: serde_json::Value =
            sqlx::query_scalar("SELECT payload FROM read_model_ops_bookings WHERE payload -> 'tickets' ? $1")
                .bind(ticket_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| ReadModelError::NotReady(format!("ticket {ticket_id} not confirmed yet")))?;

        let mut booking: OpsBooking = serde_json::from_value(payload)?;
        let Some(ticket) = booking.tickets.get_mut(&ticket_id) else {
            return Err(ReadModelError::NotReady(format!("ticket {ticket_id} not confirmed yet")));
        };
        merge(ticket);
        let booking = Self::persist(&mut *tx, booking).await?;
        tx.commit().await?;
        Ok(booking)
    }
}

#[async_trait]
impl OpsBookingStore for PostgresOpsBookings {
    async fn insert_if_absent(&self, booking: &OpsBooking) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r"
            INSERT INTO read_model_ops_bookings (booking_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (booking_id) DO NOTHING
            ",
        )
        .bind(booking.booking_id.as_uuid())
        .bind(serde_json::to_value(booking)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        merge: BookingMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || self.try_update_booking(booking_id, merge)).await
    }

    async fn update_by_ticket_id(
        &self,
        ticket_id: TicketId,
        merge: TicketMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || self.try_update_ticket(ticket_id, merge)).await
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<OpsBooking>, ReadModelError> {
        let payload: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT payload FROM read_model_ops_bookings WHERE booking_id = $1")
                .bind(booking_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload.map(serde_json::from_value).transpose()?)
    }

    async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>, ReadModelError> {
        let payloads: Vec<serde_json::Value> = match receipt_issue_date {
            Some(date) => sqlx::query_scalar(RECEIPT_DATE_FILTER).bind(date).fetch_all(&self.pool).await?,
            None => {
                sqlx::query_scalar("SELECT payload FROM read_model_ops_bookings ORDER BY booking_id")
                    .fetch_all(&self.pool)
                    .await?
            },
        };
        Ok(payloads
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?)
    }
}

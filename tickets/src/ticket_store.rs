//! Confirmed show tickets.

use crate::types::{Money, TicketId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;

/// A confirmed ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub ticket_id: TicketId,
    /// Price paid
    pub price: Money,
    /// Customer email
    pub customer_email: String,
}

/// Ticket store errors.
#[derive(Error, Debug)]
pub enum TicketError {
    /// The store failed.
    #[error("Ticket storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Ticket store.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Stores a ticket. Storing the same ticket twice keeps one row.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Database`] if the store fails.
    async fn add(&self, ticket: &Ticket) -> Result<(), TicketError>;

    /// Removes a canceled ticket. Removing an unknown ticket succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Database`] if the store fails.
    async fn remove(&self, ticket_id: TicketId) -> Result<(), TicketError>;

    /// Every stored ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Database`] if the store fails.
    async fn find_all(&self) -> Result<Vec<Ticket>, TicketError>;
}

/// Tickets stored in the `tickets` table.
#[derive(Debug, Clone)]
pub struct PostgresTicketRepository {
    pool: PgPool,
}

impl PostgresTicketRepository {
    /// Creates a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for PostgresTicketRepository {
    async fn add(&self, ticket: &Ticket) -> Result<(), TicketError> {
        sqlx::query(
            r"
            INSERT INTO tickets (ticket_id, price_amount, price_currency, customer_email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ticket_id) DO NOTHING
            ",
        )
        .bind(ticket.ticket_id.as_uuid())
        .bind(&ticket.price.amount)
        .bind(&ticket.price.currency)
        .bind(&ticket.customer_email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, ticket_id: TicketId) -> Result<(), TicketError> {
        sqlx::query("DELETE FROM tickets WHERE ticket_id = $1")
            .bind(ticket_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Ticket>, TicketError> {
        let rows = sqlx::query(
            "SELECT ticket_id, price_amount, price_currency, customer_email FROM tickets ORDER BY ticket_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let tickets = rows
            .iter()
            .map(|row| {
                Ok(Ticket {
                    ticket_id: TicketId::from_uuid(row.try_get("ticket_id")?),
                    price: Money::new(
                        row.try_get::<String, _>("price_amount")?,
                        row.try_get::<String, _>("price_currency")?,
                    ),
                    customer_email: row.try_get("customer_email")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(tickets)
    }
}

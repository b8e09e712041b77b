//! Shows and their capacity.

use crate::types::ShowId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// A show with a fixed number of seats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Show {
    /// Show id
    pub show_id: ShowId,
    /// Id of the event at the external ticket provider
    pub external_event_id: Uuid,
    /// Capacity; the ledger bound
    pub number_of_tickets: u32,
    /// When the show starts
    pub start_time: DateTime<Utc>,
    /// Title
    pub title: String,
    /// Venue
    pub venue: String,
}

/// Show store errors.
#[derive(Error, Debug)]
pub enum ShowError {
    /// No show with that id.
    #[error("Show {0} not found")]
    NotFound(ShowId),

    /// The store failed.
    #[error("Show storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Show store.
#[async_trait]
pub trait ShowRepository: Send + Sync {
    /// Stores a show. Adding an existing show id changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ShowError::Database`] if the store fails.
    async fn add(&self, show: &Show) -> Result<(), ShowError>;

    /// Loads a show.
    ///
    /// # Errors
    ///
    /// Returns [`ShowError::NotFound`] for an unknown id.
    async fn get(&self, show_id: ShowId) -> Result<Show, ShowError>;

    /// Every show.
    ///
    /// # Errors
    ///
    /// Returns [`ShowError::Database`] if the store fails.
    async fn all(&self) -> Result<Vec<Show>, ShowError>;
}

/// Shows stored in the `shows` table.
#[derive(Debug, Clone)]
pub struct PostgresShowRepository {
    pool: PgPool,
}

impl PostgresShowRepository {
    /// Creates a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_show(row: &PgRow) -> Result<Show, sqlx::Error> {
        let capacity: i32 = row.try_get("number_of_tickets")?;
        Ok(Show {
            show_id: ShowId::from_uuid(row.try_get("show_id")?),
            external_event_id: row.try_get("external_event_id")?,
            number_of_tickets: u32::try_from(capacity).unwrap_or(0),
            start_time: row.try_get("start_time")?,
            title: row.try_get("title")?,
            venue: row.try_get("venue")?,
        })
    }
}

#[async_trait]
impl ShowRepository for PostgresShowRepository {
    async fn add(&self, show: &Show) -> Result<(), ShowError> {
        sqlx::query(
            r"
            INSERT INTO shows (show_id, external_event_id, number_of_tickets, start_time, title, venue)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(show.show_id.as_uuid())
        .bind(show.external_event_id)
        .bind(i32::try_from(show.number_of_tickets).unwrap_or(i32::MAX))
        .bind(show.start_time)
        .bind(&show.title)
        .bind(&show.venue)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, show_id: ShowId) -> Result<Show, ShowError> {
        let row = sqlx::query(
            "SELECT show_id, external_event_id, number_of_tickets, start_time, title, venue FROM shows WHERE show_id = $1",
        )
        .bind(show_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ShowError::NotFound(show_id))?;
        Ok(Self::row_to_show(&row)?)
    }

    async fn all(&self) -> Result<Vec<Show>, ShowError> {
        let rows = sqlx::query(
            "SELECT show_id, external_event_id, number_of_tickets, start_time, title, venue FROM shows ORDER BY start_time",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_show).collect::<Result<_, _>>()?)
    }
}

//! Transaction helpers.
//!
//! Writers that enforce an invariant across rows (the booking ledger, the saga
//! store) run under `SERIALIZABLE`. Postgres resolves a conflicting concurrent
//! writer by failing it with SQLSTATE `40001`; [`retry_on_conflict`] re-runs the
//! whole transaction so the loser re-reads the committed state and decides
//! again.

use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;

/// Default number of attempts for a conflicting transaction.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 10;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// `READ COMMITTED`
    ReadCommitted,
    /// `REPEATABLE READ`
    RepeatableRead,
    /// `SERIALIZABLE`
    Serializable,
}

impl IsolationLevel {
    const fn statement(self) -> &'static str {
        match self {
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Begins a transaction with the given isolation level.
///
/// # Errors
///
/// Returns the database error if the transaction cannot be started.
pub async fn begin(
    pool: &PgPool,
    isolation: IsolationLevel,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(isolation.statement()).execute(&mut *tx).await?;
    Ok(tx)
}

/// Whether `error` is a serialization failure or deadlock.
#[must_use]
pub fn is_serialization_failure(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

/// Whether `error` is a unique constraint violation.
#[must_use]
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// Errors that can report a transaction conflict.
pub trait ConflictError {
    /// Whether the operation lost a race and may simply be re-run.
    fn is_conflict(&self) -> bool;
}

impl ConflictError for sqlx::Error {
    fn is_conflict(&self) -> bool {
        is_serialization_failure(self)
    }
}

/// Re-runs `operation` while it fails with a conflict, up to `max_attempts` calls.
///
/// Attempts are spaced by a short randomized delay so colliding writers spread
/// out.
///
/// # Errors
///
/// Returns the first non-conflict error, or the last conflict once the
/// attempts are spent.
pub async fn retry_on_conflict<T, E, F, Fut>(max_attempts: u32, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ConflictError,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                metrics::counter!("tickets_transaction_conflicts_total").increment(1);
                let delay = {
                    let jitter = rand::thread_rng().gen_range(2..=20);
                    Duration::from_millis(jitter * u64::from(attempt))
                };
                tracing::debug!(attempt, delay_ms = delay.as_millis(), "Transaction conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            result => return result,
        }
    }
}

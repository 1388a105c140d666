use std::future::Future;
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::house::{House, Occupancy};
use crate::ledger::{ChooseHouse, Ledger, LedgerError, LedgerResult, SortingResult};

/// A Ledger implemented on top of the `sorting_results` PostgreSQL table.
///
/// Writes are bounded by PostgreSQL's own `statement_timeout`, so a statement that runs out of
/// time is aborted and rolled back by the server. Only reads and the steps before COMMIT are
/// also bounded on the client.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    statement_timeout: time::Duration,
}

impl PgLedger {
    /// Initialize a new PgLedger connecting to the database at url.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout: time::Duration,
    ) -> LedgerResult<Self> {
        let timeout_ms = timeout_millis(statement_timeout);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(statement_timeout)
            // Session-level timeout for every statement on this connection.
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // SET does not accept bind parameters.
                    sqlx::query(&format!("SET statement_timeout = '{timeout_ms}ms'"))
                        .execute(&mut *conn)
                        .await?;

                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|error| LedgerError::ConnectionError { error })?;

        Ok(Self {
            pool,
            statement_timeout,
        })
    }

    /// Initialize a new PgLedger from an existing pool.
    pub fn new_from_pool(pool: PgPool, statement_timeout: time::Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Bound a read-only future, or the part of a transaction before COMMIT, on the client.
    /// A COMMIT must never go through here: it may still succeed on the server after the
    /// deadline fires.
    async fn bounded<T, F>(&self, fut: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        tokio::time::timeout(self.statement_timeout, fut)
            .await
            .map_err(|_| LedgerError::Timeout(self.statement_timeout))?
    }

    /// Wrap a sqlx error, singling out the failures caused by a concurrent transaction and
    /// statements cancelled by the server-side timeout.
    fn query_error(&self, command: &str, error: sqlx::Error) -> LedgerError {
        let command = command.to_owned();

        match sqlstate(&error).as_deref() {
            // 40001 Serialization Failure
            // 40P01 Deadlock Detected
            Some("40001") | Some("40P01") => LedgerError::SerializationConflict { command, error },
            // 57014 Query Canceled, raised by statement_timeout
            Some("57014") => LedgerError::Timeout(self.statement_timeout),
            _ => LedgerError::QueryError { command, error },
        }
    }

    /// Apply the statement timeout to the current transaction only, whatever pool it came from.
    async fn limit_statements(&self, conn: &mut PgConnection) -> LedgerResult<()> {
        let timeout_ms = timeout_millis(self.statement_timeout);

        sqlx::query(&format!("SET LOCAL statement_timeout = '{timeout_ms}ms'"))
            .execute(&mut *conn)
            .await
            .map_err(|error| self.query_error("SET LOCAL", error))?;

        Ok(())
    }

    async fn count_within<'c, E>(&self, executor: E) -> LedgerResult<Occupancy>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let rows: Vec<(House, i64)> = sqlx::query_as(
            r#"
SELECT
    house,
    COUNT(*)
FROM
    sorting_results
GROUP BY
    house
            "#,
        )
        .fetch_all(executor)
        .await
        .map_err(|error| self.query_error("SELECT", error))?;

        let mut occupancy = Occupancy::new();
        for (house, count) in rows {
            occupancy.set(house, u64::try_from(count).unwrap_or(0));
        }

        Ok(occupancy)
    }

    /// Count, choose and insert inside an open transaction. Nothing is visible until COMMIT.
    async fn choose_and_insert(
        &self,
        conn: &mut PgConnection,
        name: &str,
        choose: ChooseHouse<'_>,
    ) -> LedgerResult<Option<SortingResult>> {
        // SERIALIZABLE makes the GROUP BY read conflict with any concurrent insert into
        // sorting_results; one of two racing transactions fails with 40001 instead of both
        // committing past capacity.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *conn)
            .await
            .map_err(|error| self.query_error("SET TRANSACTION", error))?;

        self.limit_statements(&mut *conn).await?;

        let occupancy = self.count_within(&mut *conn).await?;

        let Some(house) = choose(&occupancy) else {
            return Ok(None);
        };

        let new_record = SortingResult::new(name, house);
        let record: SortingResult = sqlx::query_as(
            r#"
INSERT INTO sorting_results
    (id, name, house, created_at)
VALUES
    ($1, $2, $3, $4)
RETURNING
    id, name, house, created_at
            "#,
        )
        .bind(new_record.id)
        .bind(&new_record.name)
        .bind(new_record.house)
        .bind(new_record.created_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|error| self.query_error("INSERT", error))?;

        Ok(Some(record))
    }
}

/// Milliseconds for a `SET statement_timeout`, within what PostgreSQL accepts.
/// Zero would disable the timeout altogether.
fn timeout_millis(timeout: time::Duration) -> u128 {
    timeout.as_millis().clamp(1, i32::MAX as u128)
}

fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn count_by_house(&self) -> LedgerResult<Occupancy> {
        self.bounded(self.count_within(&self.pool)).await
    }

    async fn insert_chosen(
        &self,
        name: &str,
        choose: ChooseHouse<'_>,
    ) -> LedgerResult<Option<SortingResult>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| LedgerError::ConnectionError { error })?;

        // Dropping the transaction on timeout rolls it back.
        let Some(record) = self
            .bounded(self.choose_and_insert(&mut *tx, name, choose))
            .await?
        else {
            tx.rollback()
                .await
                .map_err(|error| self.query_error("ROLLBACK", error))?;
            return Ok(None);
        };

        // Left to the server-side statement_timeout set in choose_and_insert.
        tx.commit()
            .await
            .map_err(|error| self.query_error("COMMIT", error))?;

        Ok(Some(record))
    }

    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<SortingResult>> {
        self.bounded(async {
            sqlx::query_as(
                r#"
SELECT
    id, name, house, created_at
FROM
    sorting_results
WHERE
    id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| self.query_error("SELECT", error))
        })
        .await
    }

    async fn list_recent(&self, limit: u32) -> LedgerResult<Vec<SortingResult>> {
        self.bounded(async {
            sqlx::query_as(
                r#"
SELECT
    id, name, house, created_at
FROM
    sorting_results
ORDER BY
    created_at DESC,
    id DESC
LIMIT $1
                "#,
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| self.query_error("SELECT", error))
        })
        .await
    }

    async fn delete_by_id(&self, id: Uuid) -> LedgerResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| LedgerError::ConnectionError { error })?;

        let deleted = self
            .bounded(async {
                self.limit_statements(&mut *tx).await?;

                let result = sqlx::query("DELETE FROM sorting_results WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| self.query_error("DELETE", error))?;

                Ok(result.rows_affected() > 0)
            })
            .await?;

        tx.commit()
            .await
            .map_err(|error| self.query_error("COMMIT", error))?;

        Ok(deleted)
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.bounded(async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|error| self.query_error("SELECT", error))?;

            Ok(())
        })
        .await
    }
}

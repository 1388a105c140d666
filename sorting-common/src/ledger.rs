//! The durable record of every participant sorted into a house.
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::house::{House, Occupancy};

/// Enumeration of errors for operations with a Ledger.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{command} conflicted with a concurrent transaction: {error}")]
    SerializationConflict { command: String, error: sqlx::Error },
    #[error("ledger operation timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("ledger is unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether the whole atomic unit can be attempted again right away.
    /// Only conflicts with concurrent writers qualify; anything else is surfaced to the caller.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::SerializationConflict { .. })
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// A participant and the house they were sorted into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SortingResult {
    pub id: Uuid,
    pub name: String,
    pub house: House,
    pub created_at: DateTime<Utc>,
}

impl SortingResult {
    pub fn new(name: &str, house: House) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            house,
            created_at: Utc::now(),
        }
    }
}

/// Picks the house for a new record given the occupancy read in the same atomic unit.
/// Returning None means no record is written.
pub type ChooseHouse<'a> = &'a (dyn Fn(&Occupancy) -> Option<House> + Send + Sync);

#[async_trait]
pub trait Ledger {
    /// Count records per house.
    async fn count_by_house(&self) -> LedgerResult<Occupancy>;

    /// Read occupancy, let `choose` pick a house, and insert a record for it.
    /// The read and the insert form one atomic unit: no concurrent call to this method can
    /// observe the occupancy in between, so capacity checks made by `choose` hold at commit.
    async fn insert_chosen(
        &self,
        name: &str,
        choose: ChooseHouse<'_>,
    ) -> LedgerResult<Option<SortingResult>>;

    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<SortingResult>>;

    /// Most recent records first.
    async fn list_recent(&self, limit: u32) -> LedgerResult<Vec<SortingResult>>;

    /// Returns false if no record had this id.
    async fn delete_by_id(&self, id: Uuid) -> LedgerResult<bool>;

    async fn ping(&self) -> LedgerResult<()>;
}

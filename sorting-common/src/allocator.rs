//! Sort participants into houses without ever exceeding a house's capacity.
//!
//! Every call to [`Allocator::assign`] reads occupancy, picks a house and records the result
//! as one atomic unit against the [`Ledger`]. The allocator keeps no state of its own between
//! calls: occupancy is read fresh every time, so deleting a record frees its seat for the next
//! assignment without any bookkeeping here.
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::house::{Occupancy, Roster};
use crate::ledger::{Ledger, LedgerError, SortingResult};
use crate::retry::RetryPolicy;

/// Enumeration of errors returned when sorting a participant.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("all houses are full")]
    AllFull,
    #[error("failed to record sorting result: {0}")]
    PersistenceFailure(#[source] LedgerError),
    #[error("invalid name: {0}")]
    InvalidInput(String),
}

impl AllocationError {
    pub fn outcome(&self) -> &'static str {
        match self {
            AllocationError::AllFull => "all_full",
            AllocationError::PersistenceFailure(_) => "persistence_failure",
            AllocationError::InvalidInput(_) => "invalid_input",
        }
    }
}

pub struct Allocator {
    ledger: Arc<dyn Ledger + Send + Sync>,
    roster: Roster,
    retry_policy: RetryPolicy,
}

impl Allocator {
    pub fn new(
        ledger: Arc<dyn Ledger + Send + Sync>,
        roster: Roster,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            roster,
            retry_policy,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger + Send + Sync> {
        &self.ledger
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Sort `name` into a house chosen uniformly among the houses with a free seat, and record it.
    ///
    /// Conflicts with concurrent assignments are retried following the RetryPolicy; once attempts
    /// run out, or on any other ledger error, nothing has been recorded and PersistenceFailure is
    /// returned. The future may be dropped at any point before the ledger commits.
    pub async fn assign(&self, name: &str) -> Result<SortingResult, AllocationError> {
        let start_time = Instant::now();

        let result = self.assign_with_retries(name).await;

        let elapsed_time = start_time.elapsed().as_secs_f64();
        metrics::histogram!("sorting_assign_duration_seconds").record(elapsed_time);

        match &result {
            Ok(record) => {
                info!(id = %record.id, house = %record.house, "sorted participant");
                metrics::counter!(
                    "sorting_assignments_total",
                    "outcome" => "success",
                    "house" => record.house.as_str()
                )
                .increment(1);
            }
            Err(err) => {
                metrics::counter!(
                    "sorting_assignments_total",
                    "outcome" => err.outcome(),
                    "house" => "none"
                )
                .increment(1);
            }
        }

        result
    }

    async fn assign_with_retries(&self, name: &str) -> Result<SortingResult, AllocationError> {
        validate_name(name)?;

        let roster = &self.roster;
        let choose = |occupancy: &Occupancy| roster.choose(occupancy, &mut rand::thread_rng());

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            match self.ledger.insert_chosen(name, &choose).await {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => {
                    debug!("no house has a free seat");
                    return Err(AllocationError::AllFull);
                }
                Err(err) if err.is_conflict() && self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(attempt, ?backoff, "sorting conflicted with a concurrent one: {}", err);
                    metrics::counter!("sorting_assign_retries_total").increment(1);

                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    error!(attempt, "failed to record sorting result: {}", err);
                    return Err(AllocationError::PersistenceFailure(err));
                }
            }
        }
    }
}

/// Guard against names that cannot be stored. Length limits are left to callers.
fn validate_name(name: &str) -> Result<(), AllocationError> {
    if name.trim().is_empty() {
        return Err(AllocationError::InvalidInput(
            "name must not be empty".to_owned(),
        ));
    }

    if name.contains('\0') {
        return Err(AllocationError::InvalidInput(
            "name must not contain NUL characters".to_owned(),
        ));
    }

    Ok(())
}

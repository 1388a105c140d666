use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use futures::future::join_all;
use uuid::Uuid;

use sorting_common::allocator::{AllocationError, Allocator};
use sorting_common::house::{House, Occupancy, Roster};
use sorting_common::ledger::{ChooseHouse, Ledger, LedgerError, LedgerResult, SortingResult};
use sorting_common::memory::MemoryLedger;
use sorting_common::retry::RetryPolicy;

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, 2, time::Duration::from_millis(1), None)
}

fn allocator_for(ledger: MemoryLedger, roster: Roster) -> Arc<Allocator> {
    Arc::new(Allocator::new(Arc::new(ledger), roster, fast_retries(5)))
}

async fn assign_concurrently(
    allocator: &Arc<Allocator>,
    count: usize,
) -> Vec<Result<SortingResult, AllocationError>> {
    let handles = (0..count).map(|i| {
        let allocator = allocator.clone();
        tokio::spawn(async move { allocator.assign(&format!("student-{i}")).await })
    });

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("assign task panicked"))
        .collect()
}

/// A ledger whose inserts fail after reading occupancy, a set number of times.
struct FailingLedger {
    inner: MemoryLedger,
    failures_left: AtomicU32,
    conflict: bool,
}

impl FailingLedger {
    fn new(inner: MemoryLedger, failures: u32, conflict: bool) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            conflict,
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Ledger for FailingLedger {
    async fn count_by_house(&self) -> LedgerResult<Occupancy> {
        self.inner.count_by_house().await
    }

    async fn insert_chosen(
        &self,
        name: &str,
        choose: ChooseHouse<'_>,
    ) -> LedgerResult<Option<SortingResult>> {
        if self.take_failure() {
            let occupancy = self.inner.count_by_house().await?;
            let _chosen = choose(&occupancy);

            return Err(if self.conflict {
                LedgerError::SerializationConflict {
                    command: "COMMIT".to_owned(),
                    error: sqlx::Error::PoolTimedOut,
                }
            } else {
                LedgerError::Unavailable("storage went away".to_owned())
            });
        }

        self.inner.insert_chosen(name, choose).await
    }

    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<SortingResult>> {
        self.inner.get_by_id(id).await
    }

    async fn list_recent(&self, limit: u32) -> LedgerResult<Vec<SortingResult>> {
        self.inner.list_recent(limit).await
    }

    async fn delete_by_id(&self, id: Uuid) -> LedgerResult<bool> {
        self.inner.delete_by_id(id).await
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.inner.ping().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_assignments_never_exceed_capacity() {
    let ledger = MemoryLedger::new();
    let allocator = allocator_for(ledger.clone(), Roster::default());
    let extra = 20;

    let results = assign_concurrently(&allocator, 48 + extra).await;

    let successes = results.iter().filter(|result| result.is_ok()).count();
    let all_full = results
        .iter()
        .filter(|result| matches!(result, Err(AllocationError::AllFull)))
        .count();
    assert_eq!(successes, 48);
    assert_eq!(all_full, extra);

    let occupancy = ledger.count_by_house().await.unwrap();
    for house in House::ALL {
        assert_eq!(occupancy.get(house), 12);
    }
    assert_eq!(ledger.len().unwrap(), 48);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_houses_of_two_take_exactly_four() {
    let ledger = MemoryLedger::new();
    let roster = Roster::new([(House::Gryffindor, 2), (House::Hufflepuff, 2)]);
    let allocator = allocator_for(ledger.clone(), roster);

    let results = assign_concurrently(&allocator, 4).await;

    let mut per_house: HashMap<House, usize> = HashMap::new();
    for result in results {
        let record = result.expect("every seat should be taken");
        *per_house.entry(record.house).or_insert(0) += 1;
    }
    assert_eq!(per_house.get(&House::Gryffindor), Some(&2));
    assert_eq!(per_house.get(&House::Hufflepuff), Some(&2));

    let fifth = allocator.assign("x5").await;
    assert!(matches!(fifth, Err(AllocationError::AllFull)));
    assert_eq!(ledger.len().unwrap(), 4);
}

#[tokio::test]
async fn all_full_writes_nothing() {
    let ledger = MemoryLedger::new();
    let allocator = allocator_for(ledger.clone(), Roster::uniform(0));

    let result = allocator.assign("Peeves").await;

    assert!(matches!(result, Err(AllocationError::AllFull)));
    assert!(ledger.is_empty().unwrap());
}

#[tokio::test]
async fn assignments_are_uniform_over_equally_eligible_houses() {
    let ledger = MemoryLedger::new();
    let allocator = allocator_for(ledger.clone(), Roster::uniform(1_000_000));
    let trials = 10_000;

    let mut counts: HashMap<House, u64> = HashMap::new();
    for i in 0..trials {
        let record = allocator.assign(&format!("student-{i}")).await.unwrap();
        *counts.entry(record.house).or_insert(0) += 1;
    }

    // Expected 2_500 each, standard deviation ~43.
    for house in House::ALL {
        let count = counts.get(&house).copied().unwrap_or(0);
        assert!(
            (2_200..=2_800).contains(&count),
            "{house} was chosen {count} times out of {trials}"
        );
    }
}

#[tokio::test]
async fn full_house_is_never_chosen_again() {
    let ledger = MemoryLedger::new();
    let roster = Roster::uniform(1_000).with_capacity(House::Slytherin, 3);
    let allocator = allocator_for(ledger.clone(), roster);

    let mut slytherins = 0;
    for i in 0..400 {
        let record = allocator.assign(&format!("student-{i}")).await.unwrap();
        if record.house == House::Slytherin {
            slytherins += 1;
        }
    }

    assert_eq!(slytherins, 3);
    assert_eq!(
        ledger.count_by_house().await.unwrap().get(House::Slytherin),
        3
    );
}

#[tokio::test]
async fn assigned_records_read_back_until_deleted() {
    let ledger = MemoryLedger::new();
    let allocator = allocator_for(ledger.clone(), Roster::default());

    let record = allocator.assign("Ginny").await.unwrap();

    assert_eq!(record.name, "Ginny");
    assert_eq!(ledger.get_by_id(record.id).await.unwrap(), Some(record.clone()));
    assert_eq!(ledger.list_recent(50).await.unwrap(), vec![record.clone()]);

    assert!(ledger.delete_by_id(record.id).await.unwrap());
    assert_eq!(ledger.get_by_id(record.id).await.unwrap(), None);
    assert!(ledger.list_recent(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_record_frees_its_seat() {
    let ledger = MemoryLedger::new();
    let roster = Roster::new([(House::Ravenclaw, 1)]);
    let allocator = allocator_for(ledger.clone(), roster);

    let first = allocator.assign("Luna").await.unwrap();
    assert!(matches!(
        allocator.assign("Padma").await,
        Err(AllocationError::AllFull)
    ));

    assert!(ledger.delete_by_id(first.id).await.unwrap());

    let second = allocator.assign("Padma").await.unwrap();
    assert_eq!(second.house, House::Ravenclaw);
    assert_eq!(
        ledger.count_by_house().await.unwrap().get(House::Ravenclaw),
        1
    );
}

#[tokio::test]
async fn failed_write_leaves_no_trace_and_retry_succeeds() {
    let memory = MemoryLedger::new();
    let ledger = Arc::new(FailingLedger::new(memory.clone(), 1, false));
    let allocator = Allocator::new(ledger, Roster::default(), fast_retries(5));

    let failed = allocator.assign("Dean").await;

    assert!(matches!(
        failed,
        Err(AllocationError::PersistenceFailure(LedgerError::Unavailable(_)))
    ));
    assert_eq!(memory.count_by_house().await.unwrap().total(), 0);
    assert!(memory.is_empty().unwrap());

    let record = allocator.assign("Dean").await.unwrap();
    assert_eq!(memory.get_by_id(record.id).await.unwrap(), Some(record));
    assert_eq!(memory.count_by_house().await.unwrap().total(), 1);
}

#[tokio::test]
async fn conflicts_are_retried_within_bound() {
    let memory = MemoryLedger::new();
    let ledger = Arc::new(FailingLedger::new(memory.clone(), 4, true));
    let allocator = Allocator::new(ledger, Roster::default(), fast_retries(5));

    let record = allocator.assign("Seamus").await.unwrap();

    assert_eq!(memory.len().unwrap(), 1);
    assert_eq!(memory.get_by_id(record.id).await.unwrap(), Some(record));
}

#[tokio::test]
async fn conflicts_past_the_bound_are_persistence_failures() {
    let memory = MemoryLedger::new();
    let ledger = Arc::new(FailingLedger::new(memory.clone(), 5, true));
    let allocator = Allocator::new(ledger, Roster::default(), fast_retries(5));

    let result = allocator.assign("Lavender").await;

    match result {
        Err(AllocationError::PersistenceFailure(err)) => assert!(err.is_conflict()),
        other => panic!("expected a persistence failure, got {:?}", other),
    }
    assert!(memory.is_empty().unwrap());
}

#[tokio::test]
async fn invalid_names_never_reach_the_ledger() {
    let memory = MemoryLedger::new();
    // Any ledger interaction would fail.
    let ledger = Arc::new(FailingLedger::new(memory.clone(), u32::MAX, false));
    let allocator = Allocator::new(ledger, Roster::default(), fast_retries(5));

    for name in ["", "   ", "nul\0byte"] {
        assert!(matches!(
            allocator.assign(name).await,
            Err(AllocationError::InvalidInput(_))
        ));
    }
    assert!(memory.is_empty().unwrap());
}

#[tokio::test]
async fn oversized_names_are_stored_as_given() {
    let ledger = MemoryLedger::new();
    let allocator = allocator_for(ledger.clone(), Roster::default());
    let name = "Wulfric".repeat(1_000);

    let record = allocator.assign(&name).await.unwrap();

    assert_eq!(record.name, name);
    assert_eq!(ledger.get_by_id(record.id).await.unwrap(), Some(record));
}

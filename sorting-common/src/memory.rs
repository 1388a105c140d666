use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::house::Occupancy;
use crate::ledger::{ChooseHouse, Ledger, LedgerError, LedgerResult, SortingResult};

/// A Ledger kept in process memory, for local development and tests.
/// A single lock guards all records, so every insert_chosen call is a serialized decision point.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<Vec<SortingResult>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> LedgerResult<usize> {
        Ok(self.records()?.len())
    }

    pub fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.len()? == 0)
    }

    fn records(&self) -> LedgerResult<MutexGuard<'_, Vec<SortingResult>>> {
        self.records
            .lock()
            .map_err(|_| LedgerError::Unavailable("memory ledger lock poisoned".to_owned()))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn count_by_house(&self) -> LedgerResult<Occupancy> {
        let records = self.records()?;

        Ok(records.iter().map(|record| record.house).collect())
    }

    async fn insert_chosen(
        &self,
        name: &str,
        choose: ChooseHouse<'_>,
    ) -> LedgerResult<Option<SortingResult>> {
        let mut records = self.records()?;

        let occupancy: Occupancy = records.iter().map(|record| record.house).collect();
        let Some(house) = choose(&occupancy) else {
            return Ok(None);
        };

        let record = SortingResult::new(name, house);
        records.push(record.clone());

        Ok(Some(record))
    }

    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<SortingResult>> {
        let records = self.records()?;

        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    async fn list_recent(&self, limit: u32) -> LedgerResult<Vec<SortingResult>> {
        let records = self.records()?;

        // Records are appended in creation order.
        Ok(records
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> LedgerResult<bool> {
        let mut records = self.records()?;

        match records.iter().position(|record| record.id == id) {
            Some(index) => {
                records.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.records().map(|_| ())
    }
}

//! In-process snapshot store with failure injection for pipeline tests.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use credisnap_core::{OfferRecord, PipelineRun, ReviewRecord};
use uuid::Uuid;

use crate::{SnapshotError, SnapshotStore, SnapshotTx};

/// Where [`MemorySnapshotStore`] fails once on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    InsertRun,
    /// Before inserting the row at this 0-based position of the batch.
    Row(usize),
    FinishRun,
    Commit,
}

#[derive(Debug, Default)]
struct MemoryTables {
    migrations: usize,
    runs: Vec<PipelineRun>,
    offers: Vec<(Uuid, OfferRecord)>,
    reviews: Vec<(Uuid, ReviewRecord)>,
}

/// Transactional in-process snapshot store with one-shot failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    tables: Arc<StdMutex<MemoryTables>>,
    fail_point: Arc<StdMutex<Option<FailPoint>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(self, point: FailPoint) -> Self {
        *lock(&self.fail_point) = Some(point);
        self
    }

    fn trip(&self, point: FailPoint) -> Result<(), SnapshotError> {
        let mut armed = lock(&self.fail_point);
        if *armed == Some(point) {
            *armed = None;
            return Err(SnapshotError::Store(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    pub fn migrations(&self) -> usize {
        lock(&self.tables).migrations
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        lock(&self.tables).runs.clone()
    }

    pub fn run(&self, run_id: Uuid) -> Option<PipelineRun> {
        lock(&self.tables).runs.iter().find(|r| r.run_id == run_id).cloned()
    }

    pub fn offer_rows(&self, run_id: Uuid) -> Vec<OfferRecord> {
        lock(&self.tables)
            .offers
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn review_rows(&self, run_id: Uuid) -> Vec<ReviewRecord> {
        lock(&self.tables)
            .reviews
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn total_rows(&self) -> usize {
        let tables = lock(&self.tables);
        tables.offers.len() + tables.reviews.len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    type Tx = MemorySnapshotTx;

    async fn migrate(&self) -> Result<(), SnapshotError> {
        lock(&self.tables).migrations += 1;
        Ok(())
    }

    async fn begin(&self) -> Result<MemorySnapshotTx, SnapshotError> {
        self.trip(FailPoint::Begin)?;
        Ok(MemorySnapshotTx {
            store: self.clone(),
            runs: Vec::new(),
            offers: Vec::new(),
            reviews: Vec::new(),
        })
    }
}

/// Staged changes; nothing is visible in the store before `commit`.
#[derive(Debug)]
pub struct MemorySnapshotTx {
    store: MemorySnapshotStore,
    runs: Vec<PipelineRun>,
    offers: Vec<(Uuid, OfferRecord)>,
    reviews: Vec<(Uuid, ReviewRecord)>,
}

#[async_trait]
impl SnapshotTx for MemorySnapshotTx {
    async fn insert_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError> {
        self.store.trip(FailPoint::InsertRun)?;
        self.runs.push(run.clone());
        Ok(())
    }

    async fn insert_offers(&mut self, run_id: Uuid, rows: &[OfferRecord]) -> Result<(), SnapshotError> {
        for (idx, row) in rows.iter().enumerate() {
            self.store.trip(FailPoint::Row(idx))?;
            self.offers.push((run_id, row.clone()));
        }
        Ok(())
    }

    async fn insert_reviews(&mut self, run_id: Uuid, rows: &[ReviewRecord]) -> Result<(), SnapshotError> {
        for (idx, row) in rows.iter().enumerate() {
            self.store.trip(FailPoint::Row(idx))?;
            self.reviews.push((run_id, row.clone()));
        }
        Ok(())
    }

    async fn finish_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError> {
        self.store.trip(FailPoint::FinishRun)?;
        match self.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(staged) => *staged = run.clone(),
            None => return Err(SnapshotError::Store(format!("run {} not found", run.run_id))),
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), SnapshotError> {
        self.store.trip(FailPoint::Commit)?;
        let mut tables = lock(&self.store.tables);
        for run in self.runs {
            match tables.runs.iter_mut().find(|r| r.run_id == run.run_id) {
                Some(existing) => *existing = run,
                None => tables.runs.push(run),
            }
        }
        tables.offers.extend(self.offers);
        tables.reviews.extend(self.reviews);
        Ok(())
    }

    async fn rollback(self) -> Result<(), SnapshotError> {
        Ok(())
    }
}

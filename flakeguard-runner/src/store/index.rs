// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{QueryWindow, RecordSnapshot};
use crate::{errors::StorageError, record::ExecutionRecord};
use flakeguard_metadata::{BatchId, TestIdentifier};
use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

/// The records for a single test, sorted by timestamp.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestHistory {
    records: Vec<ExecutionRecord>,
    batches: HashSet<BatchId>,
}

impl TestHistory {
    pub(crate) fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    fn contains_batch(&self, batch_id: &BatchId) -> bool {
        self.batches.contains(batch_id)
    }

    fn insert(&mut self, record: ExecutionRecord) {
        // Records with equal timestamps stay in append order.
        let index = self
            .records
            .partition_point(|existing| existing.timestamp <= record.timestamp);
        self.batches.insert(record.batch_id.clone());
        self.records.insert(index, record);
    }

    pub(crate) fn range(&self, window: QueryWindow) -> Range<usize> {
        let len = self.records.len();
        match window {
            QueryWindow::All => 0..len,
            QueryWindow::Last(n) => len.saturating_sub(n)..len,
            QueryWindow::Between { start, end } => {
                let lo = self.records.partition_point(|r| r.timestamp < start);
                let hi = self.records.partition_point(|r| r.timestamp < end);
                lo..hi.max(lo)
            }
        }
    }
}

type HistorySlot = Arc<Mutex<Arc<TestHistory>>>;

/// An index from test to history, shared by the store implementations.
///
/// Appends for one test are serialized through that test's slot. Appends for different tests only
/// contend on the outer lock when a test is seen for the first time.
#[derive(Debug, Default)]
pub(crate) struct HistoryIndex {
    slots: RwLock<HashMap<TestIdentifier, HistorySlot>>,
}

impl HistoryIndex {
    /// Appends a record, calling `persist` while the test's slot is held and after the duplicate
    /// check has passed. If `persist` fails, the record is not added to the index.
    pub(crate) fn append_with(
        &self,
        record: ExecutionRecord,
        persist: impl FnOnce(&ExecutionRecord) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let slot = self.slot(&record.test_id);
        let mut history = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if history.contains_batch(&record.batch_id) {
            return Err(StorageError::DuplicateBatch {
                test_id: record.test_id,
                batch_id: record.batch_id,
            });
        }
        persist(&record)?;
        // Clones the history only if a snapshot still refers to it.
        Arc::make_mut(&mut history).insert(record);
        Ok(())
    }

    pub(crate) fn snapshot(&self, test_id: &TestIdentifier, window: QueryWindow) -> RecordSnapshot {
        let slot = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            match slots.get(test_id) {
                Some(slot) => slot.clone(),
                None => return RecordSnapshot::empty(),
            }
        };
        let history = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        RecordSnapshot::new(history, window)
    }

    pub(crate) fn tests(&self) -> Vec<TestIdentifier> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut tests: Vec<_> = slots.keys().cloned().collect();
        tests.sort_unstable();
        tests
    }

    fn slot(&self, test_id: &TestIdentifier) -> HistorySlot {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(test_id.clone())
            .or_default()
            .clone()
    }
}

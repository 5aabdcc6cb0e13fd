// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{QueryWindow, RecordSnapshot, ResultStore, index::HistoryIndex};
use crate::{errors::StorageError, record::ExecutionRecord};
use flakeguard_metadata::TestIdentifier;

/// A [`ResultStore`] that keeps records in memory only.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    index: HistoryIndex,
}

impl InMemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `records`.
    ///
    /// Duplicate records are rejected the same way [`ResultStore::append`] rejects them.
    pub fn with_records(
        records: impl IntoIterator<Item = ExecutionRecord>,
    ) -> Result<Self, StorageError> {
        let store = Self::new();
        for record in records {
            store.append(record)?;
        }
        Ok(store)
    }
}

impl ResultStore for InMemoryStore {
    fn append(&self, record: ExecutionRecord) -> Result<(), StorageError> {
        self.index.append_with(record, |_| Ok(()))
    }

    fn query(
        &self,
        test_id: &TestIdentifier,
        window: QueryWindow,
    ) -> Result<RecordSnapshot, StorageError> {
        Ok(self.index.snapshot(test_id, window))
    }

    fn tests(&self) -> Result<Vec<TestIdentifier>, StorageError> {
        Ok(self.index.tests())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EnvironmentFingerprint, Outcome, OutcomeKind};
    use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
    use flakeguard_metadata::BatchId;
    use std::{sync::Arc, thread, time::Duration};

    fn base_time() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-10-01T12:00:00+00:00").unwrap()
    }

    fn record(test: &str, batch: &str, kind: OutcomeKind, offset_secs: i64) -> ExecutionRecord {
        let outcome = match kind {
            OutcomeKind::Pass => Outcome::pass(Duration::from_millis(10)),
            OutcomeKind::Fail => Outcome::fail(Duration::from_millis(10), None),
            OutcomeKind::Error => unreachable!("not used in these tests"),
            OutcomeKind::Skipped => Outcome::skipped(),
        };
        ExecutionRecord {
            test_id: test.parse().unwrap(),
            batch_id: batch.parse().unwrap(),
            outcome,
            timestamp: base_time() + ChronoDuration::seconds(offset_secs),
            fingerprint: EnvironmentFingerprint::baseline(),
        }
    }

    #[test]
    fn duplicate_batch_is_rejected() {
        let store = InMemoryStore::new();
        store
            .append(record("a::b", "batch-1", OutcomeKind::Pass, 0))
            .unwrap();
        let err = store
            .append(record("a::b", "batch-1", OutcomeKind::Fail, 1))
            .unwrap_err();
        assert!(err.is_duplicate(), "unexpected error: {err}");

        let snapshot = store.query(&"a::b".parse().unwrap(), QueryWindow::All).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.as_slice()[0].kind(), OutcomeKind::Pass);

        // The same batch for a different test is fine.
        store
            .append(record("a::c", "batch-1", OutcomeKind::Fail, 1))
            .unwrap();
    }

    #[test]
    fn query_orders_by_timestamp() {
        let store = InMemoryStore::with_records([
            record("a::b", "batch-3", OutcomeKind::Pass, 30),
            record("a::b", "batch-1", OutcomeKind::Fail, 10),
            record("a::b", "batch-2", OutcomeKind::Pass, 20),
            record("a::b", "batch-2b", OutcomeKind::Skipped, 20),
        ])
        .unwrap();
        let test_id: TestIdentifier = "a::b".parse().unwrap();

        let all = store.query(&test_id, QueryWindow::All).unwrap();
        let batches: Vec<_> = all.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(batches, ["batch-1", "batch-2", "batch-2b", "batch-3"]);

        let last = store.query(&test_id, QueryWindow::Last(2)).unwrap();
        let batches: Vec<_> = last.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(batches, ["batch-2b", "batch-3"]);

        let between = store
            .query(
                &test_id,
                QueryWindow::Between {
                    start: base_time() + ChronoDuration::seconds(15),
                    end: base_time() + ChronoDuration::seconds(30),
                },
            )
            .unwrap();
        let batches: Vec<_> = between.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(batches, ["batch-2", "batch-2b"]);

        let unknown = store
            .query(&"x::y".parse().unwrap(), QueryWindow::All)
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_appends() {
        let store = InMemoryStore::new();
        store
            .append(record("a::b", "batch-1", OutcomeKind::Pass, 0))
            .unwrap();
        let test_id: TestIdentifier = "a::b".parse().unwrap();
        let snapshot = store.query(&test_id, QueryWindow::All).unwrap();

        store
            .append(record("a::b", "batch-2", OutcomeKind::Fail, 1))
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        // Snapshots are restartable.
        assert_eq!(snapshot.iter().count(), snapshot.iter().count());
        assert_eq!(store.query(&test_id, QueryWindow::All).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_appends_for_one_batch_accept_exactly_one() {
        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    store.append(record("a::b", "batch-1", OutcomeKind::Pass, i))
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(accepted, 1);

        let batch: BatchId = "batch-1".parse().unwrap();
        let snapshot = store.query(&"a::b".parse().unwrap(), QueryWindow::All).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.as_slice()[0].batch_id, batch);
        assert_eq!(store.tests().unwrap().len(), 1);
    }
}

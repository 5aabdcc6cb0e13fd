// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only storage of execution records.
//!
//! The [`ResultStore`] trait is the only contract the rest of flakeguard relies on. Two
//! implementations are provided:
//!
//! - [`InMemoryStore`], useful for tests and for callers that persist records themselves.
//! - [`FileStore`], which keeps records as JSON Lines in a store directory.
//!
//! Both are built on the same in-memory index. Each test's history is held behind an `Arc` and
//! replaced copy-on-write, so a [`RecordSnapshot`] stays valid (and unchanged) while writers keep
//! appending.

mod file;
mod index;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use crate::{errors::StorageError, record::ExecutionRecord};
use chrono::{DateTime, FixedOffset};
use flakeguard_metadata::TestIdentifier;
use index::TestHistory;
use std::{ops::Range, sync::Arc};

/// An append-only store of [`ExecutionRecord`]s.
///
/// Records are never deleted or modified. Retention is an external concern.
pub trait ResultStore: Send + Sync {
    /// Appends a record.
    ///
    /// Returns [`StorageError::DuplicateBatch`] if the record's batch is already recorded for its
    /// test. In that case nothing is written.
    fn append(&self, record: ExecutionRecord) -> Result<(), StorageError>;

    /// Returns the records for `test_id` within `window`, ordered by timestamp ascending.
    fn query(
        &self,
        test_id: &TestIdentifier,
        window: QueryWindow,
    ) -> Result<RecordSnapshot, StorageError>;

    /// Returns every test with at least one record, sorted.
    fn tests(&self) -> Result<Vec<TestIdentifier>, StorageError>;
}

impl<S: ResultStore + ?Sized> ResultStore for Arc<S> {
    fn append(&self, record: ExecutionRecord) -> Result<(), StorageError> {
        (**self).append(record)
    }

    fn query(
        &self,
        test_id: &TestIdentifier,
        window: QueryWindow,
    ) -> Result<RecordSnapshot, StorageError> {
        (**self).query(test_id, window)
    }

    fn tests(&self) -> Result<Vec<TestIdentifier>, StorageError> {
        (**self).tests()
    }
}

/// Bounds for a [`ResultStore::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryWindow {
    /// Every record.
    All,

    /// The most recent `n` records.
    Last(usize),

    /// Records with `start <= timestamp < end`.
    Between {
        /// The inclusive lower bound.
        start: DateTime<FixedOffset>,

        /// The exclusive upper bound.
        end: DateTime<FixedOffset>,
    },
}

/// A point-in-time view of a test's records.
///
/// Iterating a snapshot doesn't copy records, and a snapshot can be iterated any number of times.
#[derive(Clone, Debug)]
pub struct RecordSnapshot {
    history: Arc<TestHistory>,
    range: Range<usize>,
}

impl RecordSnapshot {
    pub(crate) fn new(history: Arc<TestHistory>, window: QueryWindow) -> Self {
        let range = history.range(window);
        Self { history, range }
    }

    pub(crate) fn empty() -> Self {
        Self {
            history: Arc::default(),
            range: 0..0,
        }
    }

    /// Returns the number of records in the snapshot.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns true if the snapshot has no records.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Iterates over records in timestamp order.
    pub fn iter(&self) -> std::slice::Iter<'_, ExecutionRecord> {
        self.as_slice().iter()
    }

    /// Returns the most recent record.
    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.as_slice().last()
    }

    /// Returns the records as a slice.
    pub fn as_slice(&self) -> &[ExecutionRecord] {
        &self.history.records()[self.range.clone()]
    }
}

impl<'a> IntoIterator for &'a RecordSnapshot {
    type Item = &'a ExecutionRecord;
    type IntoIter = std::slice::Iter<'a, ExecutionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

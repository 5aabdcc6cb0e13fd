// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{QueryWindow, RecordSnapshot, ResultStore, index::HistoryIndex};
use crate::{errors::StorageError, record::ExecutionRecord};
use camino::{Utf8Path, Utf8PathBuf};
use flakeguard_metadata::TestIdentifier;
use std::{
    fs::{self, File, OpenOptions, TryLockError},
    io::{self, BufRead, BufReader, Write},
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

const RECORDS_FILE_NAME: &str = "records.jsonl";
const LOCK_FILE_NAME: &str = "store.lock";

/// A [`ResultStore`] backed by a directory on disk.
///
/// Records are appended to `records.jsonl`, one JSON object per line. An exclusive lock on
/// `store.lock` is held for the lifetime of the store, so only one process can write to a store
/// directory at a time.
#[derive(Debug)]
pub struct FileStore {
    dir: Utf8PathBuf,
    records_path: Utf8PathBuf,
    index: HistoryIndex,
    writer: Mutex<File>,
    // Held for the lock.
    _lock_file: File,
}

impl FileStore {
    /// Opens the store at `dir`, creating it if necessary, and loads existing records.
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|error| StorageError::Io {
            path: dir.clone(),
            error,
        })?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|error| StorageError::Io {
                path: lock_path.clone(),
                error,
            })?;
        acquire_lock_with_retry(&lock_file, &lock_path)?;

        let records_path = dir.join(RECORDS_FILE_NAME);
        let index = HistoryIndex::default();
        let loaded = load_records(&records_path, &index)?;
        debug!(store = %dir, records = loaded, "opened result store");

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&records_path)
            .map_err(|error| StorageError::Io {
                path: records_path.clone(),
                error,
            })?;

        Ok(Self {
            dir,
            records_path,
            index,
            writer: Mutex::new(writer),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn write_line(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record).map_err(|error| StorageError::Serialize {
            test_id: record.test_id.clone(),
            error,
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|error| StorageError::Io {
                path: self.records_path.clone(),
                error,
            })
    }
}

impl ResultStore for FileStore {
    fn append(&self, record: ExecutionRecord) -> Result<(), StorageError> {
        self.index
            .append_with(record, |record| self.write_line(record))
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

fn load_records(path: &Utf8Path, index: &HistoryIndex) -> Result<usize, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => {
            return Err(StorageError::Io {
                path: path.to_owned(),
                error,
            });
        }
    };

    let mut loaded = 0;
    for (line_index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|error| StorageError::Io {
            path: path.to_owned(),
            error,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ExecutionRecord =
            serde_json::from_str(&line).map_err(|error| StorageError::Corrupt {
                path: path.to_owned(),
                line: line_index + 1,
                error,
            })?;
        match index.append_with(record, |_| Ok(())) {
            Ok(()) => loaded += 1,
            // A duplicate can only be on disk if the file was edited by hand. The first line wins.
            Err(StorageError::DuplicateBatch { test_id, batch_id }) => {
                debug!(%test_id, %batch_id, line = line_index + 1, "skipping duplicate record");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(loaded)
}

/// Acquires the store lock, retrying briefly in case another process is finishing up.
fn acquire_lock_with_retry(file: &File, lock_path: &Utf8Path) -> Result<(), StorageError> {
    const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
    const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

    let start = Instant::now();
    loop {
        match file.try_lock() {
            Ok(()) => return Ok(()),
            Err(TryLockError::WouldBlock) => {
                if start.elapsed() >= LOCK_TIMEOUT {
                    return Err(StorageError::Locked {
                        path: lock_path.to_owned(),
                    });
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(TryLockError::Error(error)) => {
                return Err(StorageError::Io {
                    path: lock_path.to_owned(),
                    error,
                });
            }
        }
    }
}

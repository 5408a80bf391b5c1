//! The append-only metrics log consumed by the dashboard.
//!
//! Clients append one [`MetricRecord`] after every local training round.
//! The log is shared mutable state across client processes on the same
//! host, so every append runs as a single read-append-rewrite sequence
//! under an exclusive file lock. The read-only query side is lenient: an
//! unreadable or corrupt log is treated as "no data yet", while the write
//! side fails loudly since dropping a record would be silent data loss.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One per-round measurement reported by a client.
///
/// Records are append-only: once written they are never edited or
/// deleted.
pub struct MetricRecord {
    /// The client-local round the record was produced in.
    pub round: u64,
    /// The mean training loss of the round.
    pub loss: f64,
    /// The held-out accuracy after the round, in `[0, 1]`.
    pub accuracy: f64,
    /// The cumulative privacy budget spent so far.
    pub epsilon: f64,
}

#[derive(Debug, Error)]
/// An error related to reading or writing the metrics log.
pub enum StoreError {
    #[error("failed to access the metrics file: {0}")]
    Io(#[from] std::io::Error),

    #[error("the metrics file holds corrupt data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// An append-only log of metric records.
///
/// Implementations must hold an exclusive lock for the whole
/// read-append-rewrite sequence and release it on every exit path, so
/// that two concurrent writers cannot lose each other's records.
pub trait MetricStore {
    /// Appends one record to the log.
    fn append(&self, record: MetricRecord) -> Result<(), StoreError>;

    /// Reads the full log in append order.
    fn read_all(&self) -> Result<Vec<MetricRecord>, StoreError>;

    /// Read-only view that maps any failure, including a missing or
    /// corrupt file, to an empty log.
    fn read_or_default(&self) -> Vec<MetricRecord> {
        self.read_all().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
/// A metric store backed by a single JSON array on disk.
///
/// Each append locks the file, reads the whole array, appends one record
/// and rewrites the file. The lock is advisory and scoped to the file, so
/// it also serializes appends from separate client processes on the same
/// host.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_records(file: &mut File) -> Result<Vec<MetricRecord>, StoreError> {
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        if buf.trim().is_empty() {
            Ok(Vec::new())
        } else {
            Ok(serde_json::from_str(&buf)?)
        }
    }
}

impl MetricStore for JsonFileStore {
    fn append(&self, record: MetricRecord) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| {
            let mut records = Self::read_records(&mut file)?;
            records.push(record);
            let buf = serde_json::to_string_pretty(&records)?;
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(buf.as_bytes())?;
            Ok(())
        })();
        let _ = file.unlock();
        result
    }

    fn read_all(&self) -> Result<Vec<MetricRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path)?;
        file.lock_shared()?;
        let result = Self::read_records(&mut file);
        let _ = file.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn record(round: u64) -> MetricRecord {
        MetricRecord {
            round,
            loss: 0.42,
            accuracy: 0.9,
            epsilon: 1.5,
        }
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        for round in 1..=5 {
            store.append(record(round)).unwrap();
        }
        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], record(1));
        assert_eq!(records[4], record(5));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("does-not-exist.json"));
        assert!(store.read_all().unwrap().is_empty());
        assert!(store.read_or_default().is_empty());
    }

    #[test]
    fn corrupt_file_is_loud_on_write_and_silent_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.append(record(1)),
            Err(StoreError::Corrupt(_))
        ));
        assert!(store.read_all().is_err());
        assert!(store.read_or_default().is_empty());
    }

    #[test]
    fn concurrent_appends_lose_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("metrics.json")));

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..20 {
                        store.append(record(writer * 100 + round)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.read_all().unwrap().len(), 40);
    }
}

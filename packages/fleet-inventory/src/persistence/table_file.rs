//! Row-file primitive: one table per file, one JSON row per line.
//!
//! Writes go to a shadow file (`<table>.tmp`) which is fsynced and atomically
//! renamed over the live file, so readers of the old file always see a
//! consistent state.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// A persisted row with a primary key.
pub trait Row: Serialize + DeserializeOwned + Clone {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
}

/// Returns true for I/O errors worth retrying.
fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Runs an I/O operation, retrying transient failures with a fixed delay.
pub fn retry_io<T>(
    mut op: impl FnMut() -> std::io::Result<T>,
    max_retries: u32,
    retry_delay_ms: u64,
    context: &'static str,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Transient I/O error while {} (attempt {}/{}): {}",
                    context,
                    attempt,
                    max_retries,
                    err
                );
                std::thread::sleep(std::time::Duration::from_millis(retry_delay_ms));
            }
            Err(err) if is_transient(&err) => {
                return Err(StoreError::TransientIo {
                    context,
                    source: err,
                })
            }
            Err(err) => {
                return Err(StoreError::Io {
                    context,
                    source: err,
                })
            }
        }
    }
}

/// In-memory image of one table, backed by a row file.
#[derive(Debug)]
pub struct TableFile<R: Row> {
    name: &'static str,
    path: PathBuf,
    rows: BTreeMap<R::Key, R>,
}

impl<R: Row> TableFile<R> {
    /// Opens a table, loading the row file if it exists.
    pub fn open(dir: &Path, name: &'static str) -> Result<Self, StoreError> {
        let path = dir.join(name);
        let mut rows = BTreeMap::new();

        if path.exists() {
            let file = File::open(&path).map_err(|e| StoreError::Io {
                context: "opening table file",
                source: e,
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| StoreError::Io {
                    context: "reading table file",
                    source: e,
                })?;
                if line.is_empty() {
                    continue;
                }
                let row: R = serde_json::from_str(&line).map_err(|e| StoreError::MalformedRow {
                    table: name,
                    reason: e.to_string(),
                })?;
                rows.insert(row.key(), row);
            }
        }

        Ok(Self { name, path, rows })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Inserts or overwrites a row under its own key.
    pub fn upsert(&mut self, row: R) {
        self.rows.insert(row.key(), row);
    }

    pub fn remove(&mut self, key: &R::Key) -> Option<R> {
        self.rows.remove(key)
    }

    /// Drops every row failing the predicate.
    pub fn retain(&mut self, pred: impl FnMut(&R::Key, &mut R) -> bool) {
        self.rows.retain(pred);
    }

    /// Replaces the full contents (snapshot write path).
    pub fn replace_all(&mut self, rows: impl IntoIterator<Item = R>) {
        self.rows.clear();
        for row in rows {
            self.rows.insert(row.key(), row);
        }
    }

    pub fn max_key(&self) -> Option<R::Key> {
        self.rows.keys().next_back().cloned()
    }

    /// 32-bit content checksum over rows in key order.
    pub fn checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        for row in self.rows.values() {
            // Row types serialize infallibly
            let line = serde_json::to_string(row).expect("row serialization failed");
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize()
    }

    /// Writes the table to its shadow file and renames it over the live file.
    pub fn flush(&self, max_retries: u32, retry_delay_ms: u64) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");

        retry_io(
            || {
                let mut file = File::create(&tmp_path)?;
                for row in self.rows.values() {
                    let line =
                        serde_json::to_string(row).expect("row serialization failed");
                    file.write_all(line.as_bytes())?;
                    file.write_all(b"\n")?;
                }
                file.sync_all()?;
                fs::rename(&tmp_path, &self.path)
            },
            max_retries,
            retry_delay_ms,
            "flushing table file",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRow {
        id: u32,
        name: String,
    }

    impl Row for TestRow {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn flush_and_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut table: TableFile<TestRow> = TableFile::open(dir.path(), "test").unwrap();
        table.upsert(TestRow {
            id: 2,
            name: "b".into(),
        });
        table.upsert(TestRow {
            id: 1,
            name: "a".into(),
        });
        table.flush(0, 0).unwrap();

        let reopened: TableFile<TestRow> = TableFile::open(dir.path(), "test").unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&1).unwrap().name, "a");
        assert_eq!(reopened.checksum(), table.checksum());
    }

    #[test]
    fn checksum_is_insertion_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut forward: TableFile<TestRow> = TableFile::open(dir.path(), "fwd").unwrap();
        let mut backward: TableFile<TestRow> = TableFile::open(dir.path(), "bwd").unwrap();

        for id in 1..=5 {
            forward.upsert(TestRow {
                id,
                name: format!("row{}", id),
            });
        }
        for id in (1..=5).rev() {
            backward.upsert(TestRow {
                id,
                name: format!("row{}", id),
            });
        }

        assert_eq!(forward.checksum(), backward.checksum());
    }
}

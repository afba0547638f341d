use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;

use crate::error::KVError;
use crate::traits::{KVStore, WriteTxn};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// RedbStore is a KVStore implementation backed by redb — a pure-Rust
/// embedded key-value database. redb admits a single writer at a time,
/// which is what makes [`KVStore::begin`] an atomic boundary for
/// read-modify-write sequences (counter increments, check-and-insert).
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open(path: &Path) -> Result<Self, KVError> {
        let db = Database::create(path).map_err(|e| KVError::Storage(e.to_string()))?;

        // Ensure the table exists by doing a write transaction.
        let write_txn = db
            .begin_write()
            .map_err(|e| KVError::Storage(e.to_string()))?;
        {
            let _table = write_txn
                .open_table(TABLE)
                .map_err(|e| KVError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| KVError::Storage(e.to_string()))?;

        debug!("opened redb database at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| KVError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;

        match table.get(key) {
            Ok(Some(val)) => Ok(Some(val.value().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(KVError::Storage(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError> {
        let mut txn = self.begin()?;
        txn.set(key, value)?;
        txn.commit()
    }

    fn delete(&self, key: &str) -> Result<(), KVError> {
        let mut txn = self.begin()?;
        txn.delete(key)?;
        txn.commit()
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| KVError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;

        scan_table(&table, prefix)
    }

    fn begin(&self) -> Result<Box<dyn WriteTxn>, KVError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| KVError::Storage(e.to_string()))?;
        Ok(Box::new(RedbWriteTxn { txn }))
    }
}

/// A redb write transaction. The table handle is opened per call so the
/// struct stays free of self-references; redb keeps dirty state on the
/// transaction, not the handle.
struct RedbWriteTxn {
    txn: WriteTransaction,
}

impl WriteTxn for RedbWriteTxn {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError> {
        let table = self
            .txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        match table.get(key) {
            Ok(Some(val)) => Ok(Some(val.value().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(KVError::Storage(e.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), KVError> {
        let mut table = self
            .txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        table
            .insert(key, value)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KVError> {
        let mut table = self
            .txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        table
            .remove(key)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError> {
        let table = self
            .txn
            .open_table(TABLE)
            .map_err(|e| KVError::Storage(e.to_string()))?;
        scan_table(&table, prefix)
    }

    fn commit(self: Box<Self>) -> Result<(), KVError> {
        self.txn
            .commit()
            .map_err(|e| KVError::Storage(e.to_string()))
    }
}

fn scan_table<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    prefix: &str,
) -> Result<Vec<(String, Vec<u8>)>, KVError> {
    let mut results = Vec::new();
    let iter = table
        .range(prefix..)
        .map_err(|e| KVError::Storage(e.to_string()))?;

    for entry in iter {
        let (key, value) = entry.map_err(|e| KVError::Storage(e.to_string()))?;
        let key_str = key.value().to_string();
        if !key_str.starts_with(prefix) {
            break;
        }
        results.push((key_str, value.value().to_vec()));
    }

    Ok(results)
}

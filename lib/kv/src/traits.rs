use crate::error::KVError;

/// KVStore provides namespaced key-value storage.
///
/// Keys follow a namespaced convention: `batch:{org}:{id}`,
/// `seq:{org}:{phase}:{week}`, `event:{org}:{batch}:{seq}`, etc. Scans
/// over a prefix return entries in key order, which is what gives
/// per-batch event history its append order.
pub trait KVStore: Send + Sync {
    /// Get the value for a key. Returns None if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError>;

    /// Set a key-value pair in its own transaction.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError>;

    /// Delete a key in its own transaction.
    fn delete(&self, key: &str) -> Result<(), KVError>;

    /// Scan all keys matching a prefix. Returns sorted (key, value) pairs.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError>;

    /// Begin a write transaction spanning multiple keys.
    ///
    /// Writers are serialized: at most one write transaction is open at
    /// a time, so a read-modify-write sequence inside one transaction is
    /// atomic with respect to every other writer. Nothing is visible to
    /// readers until [`WriteTxn::commit`]; dropping the transaction
    /// without committing discards all its writes.
    fn begin(&self) -> Result<Box<dyn WriteTxn>, KVError>;
}

/// An open write transaction.
///
/// Reads observe the transaction's own uncommitted writes.
pub trait WriteTxn: Send {
    /// Get the value for a key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError>;

    /// Set a key-value pair.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), KVError>;

    /// Delete a key.
    fn delete(&mut self, key: &str) -> Result<(), KVError>;

    /// Scan all keys matching a prefix, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError>;

    /// Commit all writes atomically.
    fn commit(self: Box<Self>) -> Result<(), KVError>;
}

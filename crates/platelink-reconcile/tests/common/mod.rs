#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use platelink_core::{IncomingRecord, Key};
use platelink_reconcile::ReconcileConfig;
use platelink_storage::{
    CommitOutcome, ConditionalTxn, KeyValueStore, ReadCommand, Reply, SqliteKvStore, StorageError,
    WriteOp,
};
use std::cell::Cell;
use std::time::Duration;

pub fn ts(offset_minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
        .single()
        .expect("valid timestamp")
        + chrono::Duration::minutes(offset_minutes)
}

pub fn record(primary: &str, secondary: &str, owner: &str) -> IncomingRecord {
    IncomingRecord::new(primary, secondary, owner, ts(0))
}

pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig::with_base_delay(Duration::ZERO)
}

pub fn memory_store() -> SqliteKvStore {
    SqliteKvStore::open_in_memory().expect("open store")
}

/// Writes a consistent pair directly, bypassing the engine.
pub fn seed_pair(store: &impl KeyValueStore, primary: &str, secondary: &str, owner: &str) {
    let txn = ConditionalTxn::new()
        .write(WriteOp::HashSet {
            key: Key::primary(primary),
            fields: vec![
                ("secondaryId".to_string(), secondary.to_string()),
                ("ownerLabel".to_string(), owner.to_string()),
            ],
        })
        .write(WriteOp::Set {
            key: Key::secondary(secondary),
            value: primary.to_string(),
        });
    assert!(store.commit(&txn).expect("seed pair").is_committed());
}

pub fn stored_secondary(store: &impl KeyValueStore, primary: &str) -> Option<String> {
    store
        .hash_get_all(&Key::primary(primary))
        .expect("read primary")
        .get("secondaryId")
        .cloned()
}

pub fn pointer(store: &impl KeyValueStore, secondary: &str) -> Option<String> {
    store.get(&Key::secondary(secondary)).expect("read pointer")
}

/// Delegating store that counts round trips, for asserting on store access.
pub struct CountingStore {
    pub inner: SqliteKvStore,
    pub pipelines: Cell<usize>,
    pub commits: Cell<usize>,
}

impl CountingStore {
    pub fn new(inner: SqliteKvStore) -> Self {
        Self {
            inner,
            pipelines: Cell::new(0),
            commits: Cell::new(0),
        }
    }

    pub fn reset(&self) {
        self.pipelines.set(0);
        self.commits.set(0);
    }
}

impl KeyValueStore for CountingStore {
    fn pipeline(&self, commands: &[ReadCommand]) -> Result<Vec<Reply>, StorageError> {
        self.pipelines.set(self.pipelines.get() + 1);
        self.inner.pipeline(commands)
    }

    fn commit(&self, txn: &ConditionalTxn) -> Result<CommitOutcome, StorageError> {
        self.commits.set(self.commits.get() + 1);
        self.inner.commit(txn)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        self.inner.delete_prefix(prefix)
    }
}

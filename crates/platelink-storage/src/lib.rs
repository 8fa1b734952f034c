use platelink_core::Key;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const KV_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("could not connect to store at {location} after {attempts} attempt(s): {reason}")]
    Connect {
        location: String,
        attempts: u32,
        reason: String,
    },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("pipeline sent {sent} commands but received {received} replies")]
    PipelineLength { sent: usize, received: usize },
    #[error("unexpected reply: expected {expected}, found {found}")]
    UnexpectedReply {
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCommand {
    Get(Key),
    HashGetAll(Key),
    SetMembers(Key),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Option<String>),
    Hash(BTreeMap<String, String>),
    Members(BTreeSet<String>),
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Value(_) => "value",
            Reply::Hash(_) => "hash",
            Reply::Members(_) => "members",
        }
    }

    pub fn into_value(self) -> Result<Option<String>, StorageError> {
        match self {
            Reply::Value(value) => Ok(value),
            other => Err(StorageError::UnexpectedReply {
                expected: "value",
                found: other.kind(),
            }),
        }
    }

    pub fn into_hash(self) -> Result<BTreeMap<String, String>, StorageError> {
        match self {
            Reply::Hash(fields) => Ok(fields),
            other => Err(StorageError::UnexpectedReply {
                expected: "hash",
                found: other.kind(),
            }),
        }
    }

    pub fn into_members(self) -> Result<BTreeSet<String>, StorageError> {
        match self {
            Reply::Members(members) => Ok(members),
            other => Err(StorageError::UnexpectedReply {
                expected: "members",
                found: other.kind(),
            }),
        }
    }
}

/// Precondition checked against current key state at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// No string, hash or set lives under the key.
    KeyAbsent(Key),
    /// String value equals `expected`; `None` means the key holds no string.
    ValueEquals { key: Key, expected: Option<String> },
    /// Hash field equals `expected`; `None` means the field is missing or blank.
    HashFieldEquals {
        key: Key,
        field: String,
        expected: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        key: Key,
        value: String,
    },
    Delete(Key),
    /// Deletes a string only while it still holds `expected`.
    DeleteIfValue {
        key: Key,
        expected: String,
    },
    /// Merges fields into a hash, leaving other fields untouched.
    HashSet {
        key: Key,
        fields: Vec<(String, String)>,
    },
    /// Removes a hash field only while it still holds `expected`.
    HashDeleteFieldIf {
        key: Key,
        field: String,
        expected: String,
    },
    SetAdd {
        key: Key,
        member: String,
    },
}

/// Guards plus writes, committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalTxn {
    pub guards: Vec<Guard>,
    pub writes: Vec<WriteOp>,
}

impl ConditionalTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn write(mut self, write: WriteOp) -> Self {
        self.writes.push(write);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Index into `ConditionalTxn::guards` of the first guard that did not hold.
    ConditionFailed { failed_guard: usize },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// The capabilities the reconciliation engine needs from a key-value store.
pub trait KeyValueStore {
    /// Executes every read in one round trip against one consistent snapshot.
    /// Replies are returned in command order.
    fn pipeline(&self, commands: &[ReadCommand]) -> Result<Vec<Reply>, StorageError>;

    fn commit(&self, txn: &ConditionalTxn) -> Result<CommitOutcome, StorageError>;

    /// Removes every key starting with `prefix`; returns the number of keys removed.
    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    fn get(&self, key: &Key) -> Result<Option<String>, StorageError> {
        single_reply(self.pipeline(&[ReadCommand::Get(key.clone())])?)?.into_value()
    }

    fn hash_get_all(&self, key: &Key) -> Result<BTreeMap<String, String>, StorageError> {
        single_reply(self.pipeline(&[ReadCommand::HashGetAll(key.clone())])?)?.into_hash()
    }

    fn set_members(&self, key: &Key) -> Result<BTreeSet<String>, StorageError> {
        single_reply(self.pipeline(&[ReadCommand::SetMembers(key.clone())])?)?.into_members()
    }
}

fn single_reply(replies: Vec<Reply>) -> Result<Reply, StorageError> {
    let received = replies.len();
    let mut replies = replies.into_iter();
    match (replies.next(), received) {
        (Some(reply), 1) => Ok(reply),
        _ => Err(StorageError::PipelineLength { sent: 1, received }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    File(PathBuf),
}

impl StoreLocation {
    fn describe(&self) -> String {
        match self {
            StoreLocation::InMemory => ":memory:".to_string(),
            StoreLocation::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub location: StoreLocation,
    /// How long a statement waits on a locked database before failing.
    pub operation_timeout: Duration,
    /// 1 means fail fast at startup.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: StoreLocation::InMemory,
            operation_timeout: Duration::from_secs(5),
            connect_attempts: 1,
            connect_retry_delay: Duration::from_millis(500),
        }
    }
}

impl StoreConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            ..Self::default()
        }
    }
}

/// SQLite-backed key-value store. Strings, hashes and sets live in separate tables
/// keyed by the namespaced storage key.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::connect(&StoreConfig::file(path.as_ref()))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::connect(&StoreConfig::default())
    }

    /// Opens the store, retrying up to `connect_attempts` times. Schema version
    /// mismatches are never retried.
    pub fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let attempts = config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match Self::try_connect(config) {
                Ok(store) => return Ok(store),
                Err(err @ StorageError::UnsupportedSchemaVersion { .. }) => return Err(err),
                Err(err) => last_error = Some(err),
            }
            if attempt < attempts && !config.connect_retry_delay.is_zero() {
                std::thread::sleep(config.connect_retry_delay);
            }
        }

        Err(StorageError::Connect {
            location: config.location.describe(),
            attempts,
            reason: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    fn try_connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let conn = match &config.location {
            StoreLocation::InMemory => Connection::open_in_memory()?,
            StoreLocation::File(path) => {
                let conn = Connection::open(path)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn
            }
        };
        conn.busy_timeout(config.operation_timeout)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > KV_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: KV_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            let sql = include_str!("../migrations/0001_kv_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl KeyValueStore for SqliteKvStore {
    fn pipeline(&self, commands: &[ReadCommand]) -> Result<Vec<Reply>, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let mut replies = Vec::with_capacity(commands.len());
        {
            let mut get_value = tx.prepare_cached("SELECT value FROM kv_strings WHERE key = ?1")?;
            let mut get_hash =
                tx.prepare_cached("SELECT field, value FROM kv_hashes WHERE key = ?1")?;
            let mut get_members =
                tx.prepare_cached("SELECT member FROM kv_sets WHERE key = ?1")?;

            for command in commands {
                let reply = match command {
                    ReadCommand::Get(key) => Reply::Value(
                        get_value
                            .query_row([key.storage_key()], |row| row.get(0))
                            .optional()?,
                    ),
                    ReadCommand::HashGetAll(key) => Reply::Hash(
                        get_hash
                            .query_map([key.storage_key()], |row| {
                                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                            })?
                            .collect::<Result<BTreeMap<_, _>, _>>()?,
                    ),
                    ReadCommand::SetMembers(key) => Reply::Members(
                        get_members
                            .query_map([key.storage_key()], |row| row.get::<_, String>(0))?
                            .collect::<Result<BTreeSet<_>, _>>()?,
                    ),
                };
                replies.push(reply);
            }
        }
        tx.commit()?;
        Ok(replies)
    }

    fn commit(&self, txn: &ConditionalTxn) -> Result<CommitOutcome, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for (index, guard) in txn.guards.iter().enumerate() {
            if !guard_holds(&tx, guard)? {
                tx.rollback()?;
                return Ok(CommitOutcome::ConditionFailed {
                    failed_guard: index,
                });
            }
        }

        for write in &txn.writes {
            apply_write(&tx, write)?;
        }

        tx.commit()?;
        Ok(CommitOutcome::Committed)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed: i64 = tx.query_row(
            "
            SELECT COUNT(*) FROM (
                SELECT key FROM kv_strings WHERE substr(key, 1, length(?1)) = ?1
                UNION
                SELECT key FROM kv_hashes WHERE substr(key, 1, length(?1)) = ?1
                UNION
                SELECT key FROM kv_sets WHERE substr(key, 1, length(?1)) = ?1
            )
            ",
            [prefix],
            |row| row.get(0),
        )?;
        for table in ["kv_strings", "kv_hashes", "kv_sets"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE substr(key, 1, length(?1)) = ?1"),
                [prefix],
            )?;
        }
        tx.commit()?;
        Ok(removed as u64)
    }
}

fn guard_holds(conn: &Connection, guard: &Guard) -> Result<bool, StorageError> {
    match guard {
        Guard::KeyAbsent(key) => {
            let exists: i64 = conn.query_row(
                "
                SELECT EXISTS(SELECT 1 FROM kv_strings WHERE key = ?1)
                    OR EXISTS(SELECT 1 FROM kv_hashes WHERE key = ?1)
                    OR EXISTS(SELECT 1 FROM kv_sets WHERE key = ?1)
                ",
                [key.storage_key()],
                |row| row.get(0),
            )?;
            Ok(exists == 0)
        }
        Guard::ValueEquals { key, expected } => {
            let current: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv_strings WHERE key = ?1",
                    [key.storage_key()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(current == *expected)
        }
        Guard::HashFieldEquals {
            key,
            field,
            expected,
        } => {
            let current: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2",
                    params![key.storage_key(), field],
                    |row| row.get(0),
                )
                .optional()?;
            // A blank field reads back as unset, so it must guard as unset too.
            Ok(current.filter(|value| !value.is_empty()) == *expected)
        }
    }
}

fn apply_write(conn: &Connection, write: &WriteOp) -> Result<(), StorageError> {
    match write {
        WriteOp::Set { key, value } => {
            conn.execute(
                "
                INSERT INTO kv_strings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value=excluded.value
                ",
                params![key.storage_key(), value],
            )?;
        }
        WriteOp::Delete(key) => {
            let storage_key = key.storage_key();
            for table in ["kv_strings", "kv_hashes", "kv_sets"] {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE key = ?1"),
                    [&storage_key],
                )?;
            }
        }
        WriteOp::DeleteIfValue { key, expected } => {
            conn.execute(
                "DELETE FROM kv_strings WHERE key = ?1 AND value = ?2",
                params![key.storage_key(), expected],
            )?;
        }
        WriteOp::HashSet { key, fields } => {
            let storage_key = key.storage_key();
            for (field, value) in fields {
                conn.execute(
                    "
                    INSERT INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key, field) DO UPDATE SET value=excluded.value
                    ",
                    params![storage_key, field, value],
                )?;
            }
        }
        WriteOp::HashDeleteFieldIf {
            key,
            field,
            expected,
        } => {
            conn.execute(
                "DELETE FROM kv_hashes WHERE key = ?1 AND field = ?2 AND value = ?3",
                params![key.storage_key(), field, expected],
            )?;
        }
        WriteOp::SetAdd { key, member } => {
            conn.execute(
                "INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?1, ?2)",
                params![key.storage_key(), member],
            )?;
        }
    }
    Ok(())
}

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::VerifyError;

/// A proof that has been accepted once and may never be accepted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedProof {
    pub idempotency_key: String,
    pub chain: String,
    pub verified_at: DateTime<Utc>,
}

impl ConsumedProof {
    pub fn new(idempotency_key: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            chain: chain.into(),
            verified_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    Consumed,
    AlreadyConsumed,
}

/// Storage backend for consumed proofs.
///
/// Implementations must be thread-safe (`Send + Sync`) and `try_consume` must
/// be atomic: of any number of concurrent callers with the same key, exactly
/// one observes [`ConsumeResult::Consumed`]. Errors are never success.
pub trait ReplayStore: Send + Sync {
    fn is_consumed(&self, idempotency_key: &str) -> Result<bool, VerifyError>;

    fn try_consume(&self, proof: &ConsumedProof) -> Result<ConsumeResult, VerifyError>;
}

/// In-memory store backed by DashMap. Single process only, lost on restart.
#[derive(Default)]
pub struct InMemoryReplayStore {
    consumed: DashMap<String, ConsumedProof>,
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }
}

impl ReplayStore for InMemoryReplayStore {
    fn is_consumed(&self, idempotency_key: &str) -> Result<bool, VerifyError> {
        Ok(self.consumed.contains_key(idempotency_key))
    }

    fn try_consume(&self, proof: &ConsumedProof) -> Result<ConsumeResult, VerifyError> {
        use dashmap::mapref::entry::Entry;
        match self.consumed.entry(proof.idempotency_key.clone()) {
            Entry::Occupied(_) => Ok(ConsumeResult::AlreadyConsumed),
            Entry::Vacant(v) => {
                v.insert(proof.clone());
                Ok(ConsumeResult::Consumed)
            }
        }
    }
}

/// Durable store backed by SQLite. The primary key is the single source of
/// truth for exactly-once consumption, across restarts and processes.
pub struct SqliteReplayStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteReplayStore {
    /// Open (or create) the replay database at `path`.
    ///
    /// On Unix the file is restricted to 0600.
    pub fn open(path: &str) -> Result<Self, VerifyError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS consumed_proofs (
                idempotency_key TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                verified_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_consumed_verified_at ON consumed_proofs(verified_at);
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set replay database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("replay store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn count(&self) -> Result<u64, VerifyError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM consumed_proofs", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl ReplayStore for SqliteReplayStore {
    fn is_consumed(&self, idempotency_key: &str) -> Result<bool, VerifyError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM consumed_proofs WHERE idempotency_key = ?1",
            [idempotency_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn try_consume(&self, proof: &ConsumedProof) -> Result<ConsumeResult, VerifyError> {
        // Plain INSERT: the PRIMARY KEY constraint decides the race.
        let result = self.conn().execute(
            "INSERT INTO consumed_proofs (idempotency_key, chain, verified_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                proof.idempotency_key,
                proof.chain,
                proof.verified_at.timestamp()
            ],
        );
        match result {
            Ok(_) => Ok(ConsumeResult::Consumed),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(ConsumeResult::AlreadyConsumed)
            }
            Err(e) => {
                tracing::error!(
                    key = %proof.idempotency_key,
                    error = %e,
                    "failed to record consumed proof"
                );
                Err(e.into())
            }
        }
    }
}

const DEFAULT_HOT_CAPACITY: usize = 10_000;

/// Durable [`ReplayStore`] fronted by an in-memory set of keys known to be
/// consumed.
///
/// The hot set only ever short-circuits to "already consumed"; a miss always
/// goes to the store.
pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    hot: DashMap<String, ()>,
    hot_capacity: usize,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self::with_hot_capacity(store, DEFAULT_HOT_CAPACITY)
    }

    pub fn with_hot_capacity(store: Arc<dyn ReplayStore>, hot_capacity: usize) -> Self {
        Self {
            store,
            hot: DashMap::new(),
            hot_capacity,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryReplayStore::new()))
    }

    pub fn is_consumed(&self, idempotency_key: &str) -> Result<bool, VerifyError> {
        if self.hot.contains_key(idempotency_key) {
            return Ok(true);
        }
        let consumed = self.store.is_consumed(idempotency_key)?;
        if consumed {
            self.remember(idempotency_key);
        }
        Ok(consumed)
    }

    pub fn try_consume(&self, proof: &ConsumedProof) -> Result<ConsumeResult, VerifyError> {
        if self.hot.contains_key(&proof.idempotency_key) {
            return Ok(ConsumeResult::AlreadyConsumed);
        }
        let result = self.store.try_consume(proof)?;
        self.remember(&proof.idempotency_key);
        Ok(result)
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    fn remember(&self, key: &str) {
        if self.hot_capacity == 0 {
            return;
        }
        if self.hot.len() >= self.hot_capacity {
            // Losing hot entries only costs a store round-trip.
            self.hot.clear();
        }
        self.hot.insert(key.to_string(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(key: &str) -> ConsumedProof {
        ConsumedProof::new(key, "base")
    }

    fn sqlite_store(dir: &tempfile::TempDir) -> SqliteReplayStore {
        let path = dir.path().join("replay.db");
        SqliteReplayStore::open(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_in_memory_try_consume_atomic() {
        let store = InMemoryReplayStore::new();
        assert_eq!(
            store.try_consume(&proof("base:0x01")).unwrap(),
            ConsumeResult::Consumed
        );
        assert_eq!(
            store.try_consume(&proof("base:0x01")).unwrap(),
            ConsumeResult::AlreadyConsumed
        );
        assert!(store.is_consumed("base:0x01").unwrap());
        assert!(!store.is_consumed("base:0x02").unwrap());
    }

    #[test]
    fn test_sqlite_try_consume_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir);

        assert!(!store.is_consumed("base:0xaa").unwrap());
        assert_eq!(
            store.try_consume(&proof("base:0xaa")).unwrap(),
            ConsumeResult::Consumed
        );
        assert_eq!(
            store.try_consume(&proof("base:0xaa")).unwrap(),
            ConsumeResult::AlreadyConsumed
        );
        assert!(store.is_consumed("base:0xaa").unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_store_persists() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = sqlite_store(&dir);
            store.try_consume(&proof("solana:5abc")).unwrap();
        }

        {
            let store = sqlite_store(&dir);
            assert!(store.is_consumed("solana:5abc").unwrap());
            assert_eq!(
                store.try_consume(&proof("solana:5abc")).unwrap(),
                ConsumeResult::AlreadyConsumed
            );
        }
    }

    #[test]
    fn test_sqlite_concurrent_consume_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(sqlite_store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.try_consume(&proof("base:0xrace")).unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == ConsumeResult::Consumed)
            .count();
        assert_eq!(winners, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_sqlite_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.db");
        let _store = SqliteReplayStore::open(path.to_str().unwrap()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_guard_hot_set_fast_rejects() {
        let store = Arc::new(InMemoryReplayStore::new());
        let guard = ReplayGuard::new(store.clone());

        assert_eq!(
            guard.try_consume(&proof("base:0x01")).unwrap(),
            ConsumeResult::Consumed
        );
        assert_eq!(guard.hot_len(), 1);
        assert!(guard.is_consumed("base:0x01").unwrap());
        assert_eq!(
            guard.try_consume(&proof("base:0x01")).unwrap(),
            ConsumeResult::AlreadyConsumed
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_guard_consults_store_on_hot_miss() {
        let store = Arc::new(InMemoryReplayStore::new());
        store.try_consume(&proof("base:0x02")).unwrap();

        // Consumed by another instance; this guard has never seen it.
        let guard = ReplayGuard::new(store);
        assert_eq!(guard.hot_len(), 0);
        assert!(guard.is_consumed("base:0x02").unwrap());
        assert_eq!(
            guard.try_consume(&proof("base:0x02")).unwrap(),
            ConsumeResult::AlreadyConsumed
        );
    }

    #[test]
    fn test_guard_hot_set_is_bounded() {
        let guard = ReplayGuard::with_hot_capacity(Arc::new(InMemoryReplayStore::new()), 2);
        for i in 0..5 {
            guard.try_consume(&proof(&format!("base:0x{i:02x}"))).unwrap();
        }
        assert!(guard.hot_len() <= 2);
        // Evicted keys are still rejected through the store.
        assert!(guard.is_consumed("base:0x00").unwrap());
    }
}

//! SQLite-backed table store shared by every process pointed at the same file

use super::TableStore;
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Scalars are stored under this reserved field name
const SCALAR_FIELD: &str = "";

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

/// Table store over a single SQLite table.
///
/// Rows are `(key, field, value, expires_at)`. A scalar is one row with an
/// empty field; a hash is one row per field. All rows of a key carry the same
/// expiry. Writes that must be atomic across processes run in `IMMEDIATE`
/// transactions, which take the database write lock up front.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unreachable(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers proceed while another process holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        debug!("Table store opened at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory store (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (key, field)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_expires ON entries(expires_at);",
        )?;
        Ok(())
    }

    /// Drop the rows of `key` if they have expired
    fn purge_expired(conn: &Connection, key: &str, now: i64) -> StoreResult<()> {
        conn.execute(
            "DELETE FROM entries WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )?;
        Ok(())
    }

    fn write_scalar(&self, key: &str, value: &str, expires_at: Option<i64>) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO entries (key, field, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, SCALAR_FIELD, value, expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert the rows of `key` unless it has live rows; `true` if inserted
    fn insert_if_absent<'a>(
        &self,
        key: &str,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.lock();
        let now = now_ms();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::purge_expired(&tx, key, now)?;

        let present: bool = tx
            .query_row(
                "SELECT 1 FROM entries WHERE key = ?1 LIMIT 1",
                params![key],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if present {
            return Ok(false);
        }

        let expires_at = deadline_ms(ttl);
        for (field, value) in fields {
            tx.execute(
                "INSERT INTO entries (key, field, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, field, value, expires_at],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn write_fields<'a>(
        &self,
        key: &str,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let now = now_ms();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::purge_expired(&tx, key, now)?;

        let is_scalar: bool = tx
            .query_row(
                "SELECT 1 FROM entries WHERE key = ?1 AND field = ?2",
                params![key, SCALAR_FIELD],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if is_scalar {
            return Err(StoreError::WrongType(key.to_string()));
        }

        let expires_at: Option<i64> = tx
            .query_row(
                "SELECT expires_at FROM entries WHERE key = ?1 LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        for (field, value) in fields {
            tx.execute(
                "INSERT OR REPLACE INTO entries (key, field, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, field, value, expires_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl TableStore for SqliteStore {
    fn ping(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT field, value FROM entries WHERE key = ?1 AND {LIVE}"
        ))?;
        let mut rows = stmt.query(params![key, now_ms()])?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => {
                let field: String = row.get(0)?;
                if field != SCALAR_FIELD {
                    return Err(StoreError::WrongType(key.to_string()));
                }
                Ok(Some(row.get(1)?))
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write_scalar(key, value, None)
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.write_scalar(key, value, Some(deadline_ms(ttl)))
    }

    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.insert_if_absent(key, [(SCALAR_FIELD, value)], ttl)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM entries WHERE key = ?1 AND {LIVE} LIMIT 1"),
                params![key, now_ms()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            &format!("DELETE FROM entries WHERE key = ?1 AND {LIVE}"),
            params![key, now_ms()],
        )?;
        conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            &format!("UPDATE entries SET expires_at = ?3 WHERE key = ?1 AND {LIVE}"),
            params![key, now_ms(), deadline_ms(ttl)],
        )?;
        Ok(updated > 0)
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let fields = self.hgetall(key)?;
        Ok(fields.get(field).cloned())
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.write_fields(key, [(field, value)])
    }

    fn hset_map(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.write_fields(key, fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    fn hset_map_if_absent_with_expiry(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.insert_if_absent(key, fields.iter().map(|(k, v)| (k.as_str(), v.as_str())), ttl)
    }

    fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT field, value FROM entries WHERE key = ?1 AND {LIVE}"
        ))?;
        let rows = stmt.query_map(params![key, now_ms()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fields = BTreeMap::new();
        for row in rows {
            let (field, value) = row?;
            if field == SCALAR_FIELD {
                return Err(StoreError::WrongType(key.to_string()));
            }
            fields.insert(field, value);
        }
        Ok(fields)
    }

    fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM entries WHERE key = ?1 AND {LIVE} AND field = ?3"),
                params![key, now_ms(), field],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT DISTINCT key FROM entries WHERE key >= ?1 AND {LIVE} ORDER BY key"
        ))?;
        let rows = stmt.query_map(params![prefix, now_ms()], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            let key = row?;
            // keys are ordered, so the first one past the prefix ends the range
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("tables.db"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("rt:host:a.example", "p1").unwrap();
        assert_eq!(
            store.get("rt:host:a.example").unwrap().as_deref(),
            Some("p1")
        );
        store.set("rt:host:a.example", "p2").unwrap();
        assert_eq!(
            store.get("rt:host:a.example").unwrap().as_deref(),
            Some("p2")
        );
        assert!(store.delete("rt:host:a.example").unwrap());
        assert_eq!(store.get("rt:host:a.example").unwrap(), None);
    }

    #[test]
    fn test_hash_and_wrong_type() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.hset("ps:p1", "mux_host", "\"n1\"").unwrap();
        store.hset("ps:p1", "mux_port", "8008").unwrap();

        assert!(store.hexists("ps:p1", "mux_host").unwrap());
        assert_eq!(store.hgetall("ps:p1").unwrap().len(), 2);
        assert!(matches!(store.get("ps:p1"), Err(StoreError::WrongType(_))));

        store.set("at:p1", "100").unwrap();
        assert!(matches!(
            store.hset("at:p1", "f", "v"),
            Err(StoreError::WrongType(_))
        ));
    }

    #[test]
    fn test_expiry() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.hset("ps:p1", "a", "1").unwrap();
        assert!(store.expire("ps:p1", Duration::from_millis(30)).unwrap());
        // a later field write keeps the key's expiry
        store.hset("ps:p1", "b", "2").unwrap();
        store
            .set_with_ttl("lk:p1", "me", Duration::from_millis(30))
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));

        assert!(!store.exists("ps:p1").unwrap());
        assert!(store.hgetall("ps:p1").unwrap().is_empty());
        assert_eq!(store.get("lk:p1").unwrap(), None);
        assert!(!store.delete("lk:p1").unwrap());
    }

    #[test]
    fn test_set_if_absent_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let first = file_store(&dir);
        let second = file_store(&dir);
        let ttl = Duration::from_millis(50);

        assert!(first.set_if_absent_with_expiry("lk:p1", "a", ttl).unwrap());
        assert!(!second.set_if_absent_with_expiry("lk:p1", "b", ttl).unwrap());

        std::thread::sleep(Duration::from_millis(80));
        assert!(second.set_if_absent_with_expiry("lk:p1", "b", ttl).unwrap());
        assert_eq!(first.get("lk:p1").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_hash_if_absent_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let first = file_store(&dir);
        let second = file_store(&dir);
        let ttl = Duration::from_secs(60);

        let ours: BTreeMap<String, String> = [("manager_pid".to_string(), "1".to_string())].into();
        let theirs: BTreeMap<String, String> = [("manager_pid".to_string(), "2".to_string())].into();

        assert!(first.hset_map_if_absent_with_expiry("ps:p1", &ours, ttl).unwrap());
        assert!(!second.hset_map_if_absent_with_expiry("ps:p1", &theirs, ttl).unwrap());
        assert_eq!(second.hgetall("ps:p1").unwrap(), ours);

        // a huge ttl saturates instead of wrapping into the past
        assert!(first
            .set_if_absent_with_expiry("lk:forever", "a", Duration::from_secs(u64::MAX))
            .unwrap());
        assert!(second.exists("lk:forever").unwrap());
    }

    #[test]
    fn test_scan_prefix() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.hset("mx:b:8008", "host", "\"b\"").unwrap();
        store.hset("mx:b:8008", "port", "8008").unwrap();
        store.hset("mx:a:8008", "host", "\"a\"").unwrap();
        store.set("ps:p1", "x").unwrap();
        store.set("mz", "x").unwrap();

        assert_eq!(
            store.scan_prefix("mx:").unwrap(),
            vec!["mx:a:8008".to_string(), "mx:b:8008".to_string()]
        );
    }
}

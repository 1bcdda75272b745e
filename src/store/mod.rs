//! Shared table store
//!
//! Every piece of cross-node state (routes, the process census, node
//! registrations and lock entries) lives behind [`TableStore`]. Gateway nodes
//! and manager children never share memory; they only share a store.
//!
//! Keys hold either a scalar string or a hash of string fields. Both kinds
//! may carry an expiry; an expired key is invisible to every operation.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound for the startup backoff between connection attempts
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Key-value store with hash fields and per-key expiry.
///
/// Implementations must make [`TableStore::set_if_absent_with_expiry`] and
/// [`TableStore::hset_map_if_absent_with_expiry`] atomic with respect to every
/// other client of the same store. The distributed lock and the process claim
/// depend on it.
pub trait TableStore: Send + Sync {
    /// Check that the store answers
    fn ping(&self) -> StoreResult<()>;

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a scalar value, replacing whatever was stored and clearing any expiry
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Set a scalar value that expires after `ttl`
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically create `key` with `value` and an expiry, unless it already exists.
    ///
    /// Returns `true` if this call created the key.
    fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> StoreResult<bool>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remove a key of either kind. Returns `true` if something was removed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Set a new expiry on an existing key. Returns `false` if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Set one hash field. An existing expiry on the key is kept.
    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Set several hash fields in one step. An existing expiry on the key is kept.
    fn hset_map(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()>;

    /// Atomically create hash `key` with `fields` and an expiry, unless the key already exists.
    ///
    /// Returns `true` if this call created the key.
    fn hset_map_if_absent_with_expiry(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// All fields of a hash; empty when the key is absent
    fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>>;

    fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Live keys starting with `prefix`, sorted ascending
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Open the store described by `config`, waiting for it to become reachable.
///
/// The SQLite file is opened with exponential backoff between attempts. With
/// no `path` the store is an in-process [`MemoryStore`]; managers cannot see
/// it, so `Config::validate` rejects that for the gateway binaries.
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn TableStore>> {
    let Some(path) = config.path.as_deref() else {
        info!("No store path configured, using an in-process table store");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let attempts = config.connect_attempts.max(1);
    let mut backoff = config.connect_backoff();
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match SqliteStore::open(path, config.busy_timeout()).and_then(|store| {
            store.ping()?;
            Ok(store)
        }) {
            Ok(store) => {
                info!(path = %path, "Table store ready");
                return Ok(Arc::new(store));
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        path = %path,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Table store not ready, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
                }
            }
        }
    }

    Err(StoreError::Unreachable(format!(
        "{} after {} attempts: {}",
        path, attempts, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_store_defaults_to_memory() {
        let store = open_store(&StoreConfig::default()).await.unwrap();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_open_store_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: Some(dir.path().join("tables.db").display().to_string()),
            ..StoreConfig::default()
        };

        let store = open_store(&config).await.unwrap();
        store.set("k", "v").unwrap();

        let reopened = open_store(&config).await.unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_open_store_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let config = StoreConfig {
            path: Some(dir.path().display().to_string()),
            connect_attempts: 2,
            connect_backoff_ms: 10,
            ..StoreConfig::default()
        };

        let result = open_store(&config).await;
        assert!(matches!(result, Err(StoreError::Unreachable(_))));
    }
}

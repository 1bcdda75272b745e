//! Typed repositories over the shared table store
//!
//! Key layout:
//!
//! | key                  | kind   | content                          |
//! |----------------------|--------|----------------------------------|
//! | `rt:host:<hostname>` | scalar | pool id                          |
//! | `rt:key:<akid>`      | scalar | pool id                          |
//! | `po:<pool_id>`       | hash   | [`PoolRecord`]                   |
//! | `ps:<pool_id>`       | hash   | [`ProcessRecord`]                |
//! | `mx:<host:port>`     | hash   | [`NodeRecord`]                   |
//! | `at:<pool_id>`       | scalar | last access, unix seconds        |
//! | `lk:<resource>`      | scalar | lock token                       |
//!
//! Hash fields hold JSON-encoded values. Nothing here caches: every call
//! reads the store, since a stale census could start a second backend.

use crate::error::{HandshakeError, StoreError, StoreResult};
use crate::store::TableStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ROUTE_HOST_PREFIX: &str = "rt:host:";
const ROUTE_KEY_PREFIX: &str = "rt:key:";
const POOL_PREFIX: &str = "po:";
const PROCESS_PREFIX: &str = "ps:";
const NODE_PREFIX: &str = "mx:";
const ACCESS_PREFIX: &str = "at:";
const LOCK_PREFIX: &str = "lk:";

pub fn route_host_key(hostname: &str) -> String {
    format!("{}{}", ROUTE_HOST_PREFIX, hostname.to_ascii_lowercase())
}

pub fn route_access_key(access_key_id: &str) -> String {
    format!("{}{}", ROUTE_KEY_PREFIX, access_key_id)
}

pub fn pool_key(pool_id: &str) -> String {
    format!("{}{}", POOL_PREFIX, pool_id)
}

pub fn process_key(pool_id: &str) -> String {
    format!("{}{}", PROCESS_PREFIX, pool_id)
}

pub fn node_key(node: &Endpoint) -> String {
    format!("{}{}", NODE_PREFIX, node)
}

pub fn access_time_key(pool_id: &str) -> String {
    format!("{}{}", ACCESS_PREFIX, pool_id)
}

pub fn lock_key(resource: &str) -> String {
    format!("{}{}", LOCK_PREFIX, resource)
}

/// A `(host, port)` pair: a gateway node or a backend listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = HandshakeError;

    /// Parse `host:port` or `[v6addr]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(HandshakeError::Empty);
        }

        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => {
                let (host, tail) = rest
                    .split_once(']')
                    .ok_or_else(|| HandshakeError::MissingPort(s.to_string()))?;
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| HandshakeError::MissingPort(s.to_string()))?;
                (host, port)
            }
            None => s
                .rsplit_once(':')
                .ok_or_else(|| HandshakeError::MissingPort(s.to_string()))?,
        };

        if host.is_empty() {
            return Err(HandshakeError::EmptyHost(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| HandshakeError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(HandshakeError::InvalidPort(s.to_string()));
        }

        Ok(Endpoint::new(host, port))
    }
}

/// A tenant's storage namespace. Written by administrative tooling only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_id: String,
    pub owner: String,
    pub buckets_directory: String,
    #[serde(default)]
    pub access_keys: Vec<String>,
    #[serde(default)]
    pub direct_hostnames: Vec<String>,
}

/// Where a pool's backend is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub mux_host: String,
    pub mux_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    pub manager_pid: u32,
    #[serde(default)]
    pub backend_pid: Option<u32>,
    /// Unix seconds
    pub started_at: i64,
}

impl ProcessRecord {
    /// The gateway node hosting the backend
    pub fn mux_endpoint(&self) -> Endpoint {
        Endpoint::new(self.mux_host.clone(), self.mux_port)
    }

    pub fn backend_endpoint(&self) -> Endpoint {
        Endpoint::new(self.backend_host.clone(), self.backend_port)
    }
}

/// A live gateway node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub host: String,
    pub port: u16,
    /// Unix seconds
    pub started_at: i64,
    /// Unix seconds
    pub last_heartbeat: i64,
}

impl NodeRecord {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

fn not_an_object(key: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        source: <serde_json::Error as serde::ser::Error>::custom("record is not a JSON object"),
    }
}

/// Flatten a record into JSON-encoded hash fields
fn encode_fields<T: Serialize>(key: &str, record: &T) -> StoreResult<BTreeMap<String, String>> {
    let value = serde_json::to_value(record).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })?;
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect()),
        _ => Err(not_an_object(key)),
    }
}

fn decode_fields<T: DeserializeOwned>(
    key: &str,
    fields: BTreeMap<String, String>,
) -> StoreResult<T> {
    let corrupt = |source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    };
    let mut map = serde_json::Map::new();
    for (field, raw) in fields {
        map.insert(field, serde_json::from_str(&raw).map_err(corrupt)?);
    }
    serde_json::from_value(serde_json::Value::Object(map)).map_err(corrupt)
}

/// Typed view of the table store
#[derive(Clone)]
pub struct Tables {
    store: Arc<dyn TableStore>,
}

impl Tables {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    fn read_record<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let fields = self.store.hgetall(key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_fields(key, fields).map(Some)
    }

    fn write_record<T: Serialize>(&self, key: &str, record: &T) -> StoreResult<()> {
        let fields = encode_fields(key, record)?;
        self.store.hset_map(key, &fields)
    }

    // === Routes ===

    pub fn pool_by_hostname(&self, hostname: &str) -> StoreResult<Option<String>> {
        self.store.get(&route_host_key(hostname))
    }

    pub fn pool_by_access_key(&self, access_key_id: &str) -> StoreResult<Option<String>> {
        self.store.get(&route_access_key(access_key_id))
    }

    /// Resolve a request to a pool id. The hostname wins when both are given.
    pub fn resolve_pool(
        &self,
        hostname: Option<&str>,
        access_key_id: Option<&str>,
    ) -> StoreResult<Option<String>> {
        if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
            return self.pool_by_hostname(hostname);
        }
        if let Some(access_key_id) = access_key_id.filter(|k| !k.is_empty()) {
            return self.pool_by_access_key(access_key_id);
        }
        Ok(None)
    }

    // === Pools ===

    /// Store a pool and its route records
    pub fn insert_pool(&self, pool: &PoolRecord) -> StoreResult<()> {
        let key = pool_key(&pool.pool_id);
        self.store.delete(&key)?;
        self.write_record(&key, pool)?;
        for access_key in &pool.access_keys {
            self.store.set(&route_access_key(access_key), &pool.pool_id)?;
        }
        for hostname in &pool.direct_hostnames {
            self.store.set(&route_host_key(hostname), &pool.pool_id)?;
        }
        debug!(pool_id = %pool.pool_id, "Stored pool");
        Ok(())
    }

    pub fn get_pool(&self, pool_id: &str) -> StoreResult<Option<PoolRecord>> {
        self.read_record(&pool_key(pool_id))
    }

    /// Remove a pool and the routes that still point at it
    pub fn delete_pool(&self, pool_id: &str) -> StoreResult<bool> {
        let Some(pool) = self.get_pool(pool_id)? else {
            return Ok(false);
        };
        for access_key in &pool.access_keys {
            let key = route_access_key(access_key);
            if self.store.get(&key)?.as_deref() == Some(pool_id) {
                self.store.delete(&key)?;
            }
        }
        for hostname in &pool.direct_hostnames {
            let key = route_host_key(hostname);
            if self.store.get(&key)?.as_deref() == Some(pool_id) {
                self.store.delete(&key)?;
            }
        }
        self.store.delete(&pool_key(pool_id))
    }

    // === Processes ===

    pub fn get_process(&self, pool_id: &str) -> StoreResult<Option<ProcessRecord>> {
        self.read_record(&process_key(pool_id))
    }

    /// Write a process record that expires unless refreshed within `ttl`
    pub fn set_process(&self, pool_id: &str, record: &ProcessRecord, ttl: Duration) -> StoreResult<()> {
        let key = process_key(pool_id);
        self.write_record(&key, record)?;
        self.store.expire(&key, ttl)?;
        Ok(())
    }

    /// Write a process record only if the pool has none; `false` means another
    /// manager holds it
    pub fn claim_process(&self, pool_id: &str, record: &ProcessRecord, ttl: Duration) -> StoreResult<bool> {
        let key = process_key(pool_id);
        let fields = encode_fields(&key, record)?;
        self.store.hset_map_if_absent_with_expiry(&key, &fields, ttl)
    }

    pub fn refresh_process(&self, pool_id: &str, ttl: Duration) -> StoreResult<bool> {
        self.store.expire(&process_key(pool_id), ttl)
    }

    pub fn delete_process(&self, pool_id: &str) -> StoreResult<bool> {
        self.store.delete(&process_key(pool_id))
    }

    /// Every running backend, ordered by pool id
    pub fn list_processes(&self) -> StoreResult<Vec<(String, ProcessRecord)>> {
        let mut processes = Vec::new();
        for key in self.store.scan_prefix(PROCESS_PREFIX)? {
            // may expire between the scan and the read
            if let Some(record) = self.read_record::<ProcessRecord>(&key)? {
                let pool_id = key[PROCESS_PREFIX.len()..].to_string();
                processes.push((pool_id, record));
            }
        }
        Ok(processes)
    }

    // === Nodes ===

    pub fn register_node(&self, record: &NodeRecord, ttl: Duration) -> StoreResult<()> {
        let key = node_key(&record.endpoint());
        self.write_record(&key, record)?;
        self.store.expire(&key, ttl)?;
        Ok(())
    }

    pub fn deregister_node(&self, node: &Endpoint) -> StoreResult<bool> {
        self.store.delete(&node_key(node))
    }

    /// Every registered gateway node, ordered by endpoint
    pub fn list_nodes(&self) -> StoreResult<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for key in self.store.scan_prefix(NODE_PREFIX)? {
            if let Some(record) = self.read_record::<NodeRecord>(&key)? {
                nodes.push(record);
            }
        }
        Ok(nodes)
    }

    // === Access times ===

    pub fn set_access_time(&self, pool_id: &str, unix_secs: i64) -> StoreResult<()> {
        self.store.set(&access_time_key(pool_id), &unix_secs.to_string())
    }

    pub fn get_access_time(&self, pool_id: &str) -> StoreResult<Option<i64>> {
        let key = access_time_key(pool_id);
        match self.store.get(&key)? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| StoreError::Corrupt {
                    key,
                    source: <serde_json::Error as serde::de::Error>::custom(format!(
                        "not a timestamp: {}",
                        raw
                    )),
                }),
        }
    }

    pub fn delete_access_time(&self, pool_id: &str) -> StoreResult<bool> {
        self.store.delete(&access_time_key(pool_id))
    }
}

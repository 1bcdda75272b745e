use super::TableStore;
use crate::error::{StoreError, StoreResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// In-process table store.
///
/// Each key is guarded by its dashmap shard, which makes every single-key
/// operation atomic, including set-if-absent. Expired keys are dropped lazily
/// when touched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a live slot, removing it if it has expired
    fn live<T>(&self, key: &str, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key) {
            if slot.is_live(now) {
                return Some(f(&slot));
            }
        } else {
            return None;
        }
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        None
    }

    /// Store `slot` unless a live entry exists; `true` if stored
    fn insert_if_absent(&self, key: &str, slot: Slot) -> bool {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(Instant::now()) {
                    false
                } else {
                    occupied.insert(slot);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }

    fn update_hash(
        &self,
        key: &str,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> StoreResult<()> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    let mut fields = BTreeMap::new();
                    apply(&mut fields);
                    occupied.insert(Slot::new(Value::Hash(fields), None));
                    return Ok(());
                }
                match &mut occupied.get_mut().value {
                    Value::Hash(fields) => {
                        apply(fields);
                        Ok(())
                    }
                    Value::Scalar(_) => Err(StoreError::WrongType(key.to_string())),
                }
            }
            Entry::Vacant(vacant) => {
                let mut fields = BTreeMap::new();
                apply(&mut fields);
                vacant.insert(Slot::new(Value::Hash(fields), None));
                Ok(())
            }
        }
    }
}

impl TableStore for MemoryStore {
    fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.live(key, |slot| slot.value.clone()) {
            None => Ok(None),
            Some(Value::Scalar(value)) => Ok(Some(value)),
            Some(Value::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot::new(Value::Scalar(value.to_string()), None),
        );
        Ok(())
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot::new(Value::Scalar(value.to_string()), Some(ttl)),
        );
        Ok(())
    }

    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        Ok(self.insert_if_absent(key, Slot::new(Value::Scalar(value.to_string()), Some(ttl))))
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live(key, |_| ()).is_some())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .map_or(false, |(_, slot)| slot.is_live(now)))
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        match self.live(key, |slot| match &slot.value {
            Value::Hash(fields) => Ok(fields.get(field).cloned()),
            Value::Scalar(_) => Err(StoreError::WrongType(key.to_string())),
        }) {
            None => Ok(None),
            Some(result) => result,
        }
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.update_hash(key, |fields| {
            fields.insert(field.to_string(), value.to_string());
        })
    }

    fn hset_map(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.update_hash(key, |existing| {
            existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
    }

    fn hset_map_if_absent_with_expiry(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        Ok(self.insert_if_absent(key, Slot::new(Value::Hash(fields.clone()), Some(ttl))))
    }

    fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        match self.live(key, |slot| slot.value.clone()) {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(fields)) => Ok(fields),
            Some(Value::Scalar(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self.hget(key, field)?.is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

//! Advisory, self-expiring mutual exclusion over the table store
//!
//! A lock is a scalar entry `lk:<resource>` created with set-if-absent and an
//! expiry. Whoever created it holds the lock until it unlocks or the entry
//! expires. There are no fencing tokens: a holder that outlives its expiry
//! is not told, and `unlock` removes the entry even if someone else has taken
//! it since. Lock lifetimes must therefore cover the longest critical section.

use crate::error::StoreResult;
use crate::store::TableStore;
use crate::tables::lock_key;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Interval between attempts while waiting for a held lock
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct Held {
    key: String,
    token: String,
}

/// One locker. An instance holds at most one lock at a time.
pub struct DistributedLock {
    store: Arc<dyn TableStore>,
    locker_name: String,
    poll_interval: Duration,
    held: Mutex<Option<Held>>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn TableStore>, locker_name: impl Into<String>) -> Self {
        Self {
            store,
            locker_name: locker_name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            held: Mutex::new(None),
        }
    }

    /// Set the polling interval used by [`lock`](Self::lock) and [`wait4_unlock`](Self::wait4_unlock)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The resource currently held by this instance
    pub fn held_resource(&self) -> Option<String> {
        self.held
            .lock()
            .as_ref()
            .map(|held| held.key.trim_start_matches("lk:").to_string())
    }

    fn new_token(&self) -> String {
        format!(
            "{}:{}",
            self.locker_name,
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// Try once to take the lock on `resource` for `timeout`.
    ///
    /// Returns `false` when another holder has it; that is contention, not an error.
    pub fn trylock(&self, resource: &str, timeout: Duration) -> StoreResult<bool> {
        let key = lock_key(resource);
        let token = self.new_token();
        if !self
            .store
            .set_if_absent_with_expiry(&key, &token, timeout)?
        {
            return Ok(false);
        }

        let mut held = self.held.lock();
        if let Some(previous) = held.as_ref() {
            warn!(
                locker = %self.locker_name,
                previous = %previous.key,
                key = %key,
                "Locker took a second lock, forgetting the first"
            );
        }
        debug!(locker = %self.locker_name, key = %key, "Locked");
        *held = Some(Held { key, token });
        Ok(true)
    }

    /// Take the lock on `resource`, waiting while someone else holds it.
    ///
    /// There is no bound on the wait; wrap the call in
    /// [`tokio::time::timeout`] to impose one.
    pub async fn lock(&self, resource: &str, timeout: Duration) -> StoreResult<()> {
        loop {
            if self.trylock(resource, timeout)? {
                return Ok(());
            }
            self.wait4_unlock(resource, self.poll_interval).await?;
        }
    }

    /// Like [`lock`](Self::lock) but returns a guard that unlocks on drop
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> StoreResult<LockGuard<'_>> {
        self.lock(resource, timeout).await?;
        Ok(LockGuard { lock: self })
    }

    /// Release the held lock.
    ///
    /// If the entry now carries another locker's token it is deleted anyway
    /// and the mismatch is logged. Calling this without holding a lock is a
    /// no-op.
    pub fn unlock(&self) -> StoreResult<()> {
        let Some(held) = self.held.lock().take() else {
            return Ok(());
        };

        match self.store.get(&held.key)? {
            Some(current) if current != held.token => {
                error!(
                    locker = %self.locker_name,
                    key = %held.key,
                    ours = %held.token,
                    theirs = %current,
                    "Unlocking a lock held by another locker"
                );
            }
            None => {
                warn!(
                    locker = %self.locker_name,
                    key = %held.key,
                    "Lock expired before unlock"
                );
            }
            Some(_) => {}
        }

        self.store.delete(&held.key)?;
        debug!(locker = %self.locker_name, key = %held.key, "Unlocked");
        Ok(())
    }

    /// Wait until nobody holds `resource`, checking every `delay`
    pub async fn wait4_unlock(&self, resource: &str, delay: Duration) -> StoreResult<()> {
        let key = lock_key(resource);
        while self.store.exists(&key)? {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Releases its [`DistributedLock`] when dropped
pub struct LockGuard<'a> {
    lock: &'a DistributedLock,
}

impl LockGuard<'_> {
    /// Release now and report the store error, if any
    pub fn release(self) -> StoreResult<()> {
        let result = self.lock.unlock();
        std::mem::forget(self);
        result
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            error!(locker = %self.lock.locker_name, error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Instant;

    fn store() -> Arc<dyn TableStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_trylock_excludes_second_locker() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        let b = DistributedLock::new(store.clone(), "b");
        let ttl = Duration::from_secs(60);

        assert!(a.trylock("p1", ttl).unwrap());
        assert!(!b.trylock("p1", ttl).unwrap());
        assert_eq!(a.held_resource().as_deref(), Some("p1"));
        assert_eq!(b.held_resource(), None);

        // other resources are independent
        assert!(b.trylock("p2", ttl).unwrap());
    }

    #[test]
    fn test_unlock_then_relock() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        let b = DistributedLock::new(store.clone(), "b");
        let ttl = Duration::from_secs(60);

        assert!(a.trylock("p1", ttl).unwrap());
        a.unlock().unwrap();
        assert!(!store.exists("lk:p1").unwrap());
        assert!(b.trylock("p1", ttl).unwrap());

        // unlocking twice is harmless
        a.unlock().unwrap();
        assert!(store.exists("lk:p1").unwrap());
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let store = store();
        let crashed = DistributedLock::new(store.clone(), "crashed");
        let b = DistributedLock::new(store.clone(), "b");

        assert!(crashed.trylock("p1", Duration::from_millis(30)).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.trylock("p1", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_unlock_deletes_foreign_token() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        let b = DistributedLock::new(store.clone(), "b");

        assert!(a.trylock("p1", Duration::from_millis(20)).unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.trylock("p1", Duration::from_secs(60)).unwrap());

        // no fencing: the stale holder removes b's entry
        a.unlock().unwrap();
        assert!(!store.exists("lk:p1").unwrap());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let store = store();
        let a = Arc::new(DistributedLock::new(store.clone(), "a"));
        let b = DistributedLock::new(store.clone(), "b").with_poll_interval(Duration::from_millis(10));

        assert!(a.trylock("p1", Duration::from_secs(60)).unwrap());

        let releaser = {
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                a.unlock().unwrap();
            })
        };

        let start = Instant::now();
        b.lock("p1", Duration::from_secs(60)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(b.held_resource().as_deref(), Some("p1"));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_can_be_bounded() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        let b = DistributedLock::new(store.clone(), "b").with_poll_interval(Duration::from_millis(10));

        assert!(a.trylock("p1", Duration::from_secs(60)).unwrap());
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            b.lock("p1", Duration::from_secs(60)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(b.held_resource(), None);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        {
            let _guard = a.acquire("p1", Duration::from_secs(60)).await.unwrap();
            assert!(store.exists("lk:p1").unwrap());
        }
        assert!(!store.exists("lk:p1").unwrap());

        let guard = a.acquire("p1", Duration::from_secs(60)).await.unwrap();
        guard.release().unwrap();
        assert!(!store.exists("lk:p1").unwrap());
    }

    #[tokio::test]
    async fn test_wait4_unlock_returns_when_free() {
        let store = store();
        let a = DistributedLock::new(store.clone(), "a");
        a.wait4_unlock("p1", Duration::from_millis(10)).await.unwrap();

        assert!(a.trylock("p1", Duration::from_millis(50)).unwrap());
        let start = Instant::now();
        a.wait4_unlock("p1", Duration::from_millis(10)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

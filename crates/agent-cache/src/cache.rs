//! TTL key/value store
//!
//! Every entry carries an absolute expiry instant. Expired entries are
//! invisible to readers immediately and are physically removed either lazily
//! on access or by [`Cache::purge_expired`].

use crate::error::CacheError;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Type-erased value stored in the cache
pub type CacheValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: CacheValue,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory cache with per-entry time-to-live.
///
/// The cache only guards its own index. Values are shared `Arc`s; callers
/// that need to mutate a value must give it its own interior lock.
#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl Cache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // The index holds no invariants that a panicking writer could break.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// The entry expires `ttl` from now; setting an existing key refreshes
    /// its expiry.
    pub fn set(&self, key: impl Into<String>, value: CacheValue, ttl: Duration) {
        let key = key.into();
        trace!("cache set {} (ttl {:?})", key, ttl);
        self.lock().insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Get the value stored under `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                trace!("cache entry {} expired", key);
                entries.remove(key);
                None
            }
            Some(entry) => Some(Arc::clone(&entry.value)),
            None => None,
        }
    }

    /// Get the value stored under `key` as a `T`.
    ///
    /// Returns `Ok(None)` when the key is absent or expired, and
    /// [`CacheError::InvalidFormat`] when a value exists but is not a `T`.
    pub fn get_as<T>(&self, key: &str) -> Result<Option<Arc<T>>, CacheError>
    where
        T: Any + Send + Sync,
    {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .downcast::<T>()
            .map(Some)
            .map_err(|_| CacheError::InvalidFormat { key: key.to_string() })
    }

    /// Get the `T` stored under `key`, inserting the result of `create` if
    /// the key is absent or expired.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers for
    /// the same key always observe the same value. An inserted value expires
    /// `ttl` from now; an existing value keeps its current expiry.
    pub fn get_or_insert_with<T, F>(&self, key: &str, ttl: Duration, create: F) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(entry) = entries.get(key)
            && !entry.is_expired(now)
        {
            return Arc::clone(&entry.value)
                .downcast::<T>()
                .map_err(|_| CacheError::InvalidFormat { key: key.to_string() });
        }

        trace!("cache miss for {}, inserting new value", key);
        let value = Arc::new(create());
        entries.insert(
            key.to_string(),
            Entry {
                value: Arc::clone(&value) as CacheValue,
                expires_at: now + ttl,
            },
        );
        Ok(value)
    }

    /// Remove `key` from the cache, returning whether a live entry existed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of live (non-expired) entries
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|entry| !entry.is_expired(now)).count()
    }

    /// Whether the cache has no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

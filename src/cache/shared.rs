//! Thread-safe wrapper around [`LruCache`].
//!
//! All mutations of the entry set and of the recency order happen under the
//! write half of one `RwLock`.  Lookups that promote take the write lock
//! too; only the `peek*`/`len` observations use the read lock.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CacheError;

use super::lru::{Insertion, LruCache};

/// An [`LruCache`] that can be shared between tasks behind an `Arc`.
#[derive(Debug)]
pub struct SharedLru<K, V> {
    inner: RwLock<LruCache<K, V>>,
}

impl<K: Hash + Eq + Clone, V> SharedLru<K, V> {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: RwLock::new(LruCache::new(capacity)?),
        })
    }

    pub fn capacity(&self) -> usize {
        self.read().capacity()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether `key` is cached, without promoting it.
    pub fn peek_contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read().peek_contains(key)
    }

    /// Whether `key` is cached.  A hit promotes the key.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.write().contains(key)
    }

    /// Clone out the value for `key`, promoting it on a hit.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.write().get(key).cloned()
    }

    /// See [`LruCache::insert`].
    pub fn insert(&self, key: K, value: V) -> Insertion<K, V> {
        self.write().insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.write().remove(key)
    }

    /// Empty the cache, returning every entry oldest first.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.write().drain()
    }

    /// Snapshot of the keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        self.read().keys().cloned().collect()
    }

    // A panic while holding the lock cannot leave the list half-linked in a
    // way later callers could observe, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, LruCache<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LruCache<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

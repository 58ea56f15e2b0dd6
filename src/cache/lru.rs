//! Fixed-capacity least-recently-used cache.
//!
//! Entries live in a slab (`Vec<Node>`) threaded by an intrusive
//! doubly-linked recency list: the head is the most recently used entry, the
//! tail is the next eviction candidate.  A `HashMap` maps keys to slab
//! slots.  Every operation is O(1); removal uses `swap_remove` and patches
//! the links of the node that moved into the vacated slot.
//!
//! Recency is updated by inserts and by the promoting lookups
//! ([`LruCache::get`], [`LruCache::contains`]).  The `peek*` variants observe
//! without touching the order.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::CacheError;

const NIL: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Result of [`LruCache::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum Insertion<K, V> {
    /// The key was new and there was room for it.
    Inserted,
    /// The key was already cached; holds the value it replaced.  The entry
    /// was promoted and nothing was evicted.
    Updated(V),
    /// The key was new and the cache was full; holds the evicted
    /// least-recently-used entry.
    Evicted(K, V),
}

/// Bounded map with least-recently-used eviction.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.nodes.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `key` is cached.  A hit counts as a use and promotes the key.
    pub fn contains<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.promote(idx);
                true
            }
            None => false,
        }
    }

    /// Whether `key` is cached, without changing its recency.
    pub fn peek_contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Look up `key`, promoting it to most recently used on a hit.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.get(key).copied()?;
        self.promote(idx);
        Some(&self.nodes[idx].value)
    }

    /// Look up `key` without changing its recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|&idx| &self.nodes[idx].value)
    }

    /// The current eviction candidate.
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        if self.tail == NIL {
            return None;
        }
        let node = &self.nodes[self.tail];
        Some((&node.key, &node.value))
    }

    /// Insert or replace `key`, making it the most recently used entry.
    ///
    /// Inserting a new key into a full cache evicts exactly one entry, the
    /// least recently used, and hands it back to the caller so it can be
    /// released.
    pub fn insert(&mut self, key: K, value: V) -> Insertion<K, V> {
        if let Some(&idx) = self.map.get(&key) {
            let old = std::mem::replace(&mut self.nodes[idx].value, value);
            self.promote(idx);
            return Insertion::Updated(old);
        }

        let evicted = if self.nodes.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.attach_front(idx);
        self.map.insert(key, idx);

        match evicted {
            Some((k, v)) => Insertion::Evicted(k, v),
            None => Insertion::Inserted,
        }
    }

    /// Remove `key` and return its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.get(key).copied()?;
        let (_key, value) = self.remove_at(idx);
        Some(value)
    }

    /// Remove and return the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        Some(self.remove_at(self.tail))
    }

    /// Empty the cache, returning every entry from least to most recently
    /// used.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut entries = Vec::with_capacity(self.nodes.len());
        while let Some(entry) = self.pop_lru() {
            entries.push(entry);
        }
        entries
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys {
            cache: self,
            cursor: self.head,
        }
    }
}

// ---------------------------------------------------------------------------
// Recency list bookkeeping
// ---------------------------------------------------------------------------

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head == NIL {
            self.tail = idx;
        } else {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
    }

    fn remove_at(&mut self, idx: usize) -> (K, V) {
        self.detach(idx);
        let node = self.nodes.swap_remove(idx);
        self.map.remove(&node.key);

        // The former last slot now lives at `idx`; repoint its neighbours.
        if idx < self.nodes.len() {
            let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
            if prev == NIL {
                self.head = idx;
            } else {
                self.nodes[prev].next = idx;
            }
            if next == NIL {
                self.tail = idx;
            } else {
                self.nodes[next].prev = idx;
            }
            if let Some(slot) = self.map.get_mut(&self.nodes[idx].key) {
                *slot = idx;
            }
        }

        (node.key, node.value)
    }
}

/// Iterator over cache keys from most to least recently used.
pub struct Keys<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.cache.nodes[self.cursor];
        self.cursor = node.next;
        Some(&node.key)
    }
}

// ---------------------------------------------------------------------------
// LruSet
// ---------------------------------------------------------------------------

/// Key-only variant of [`LruCache`].
#[derive(Debug)]
pub struct LruSet<K> {
    inner: LruCache<K, ()>,
}

impl<K: Hash + Eq + Clone> LruSet<K> {
    pub fn new(max_size: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: LruCache::new(max_size)?,
        })
    }

    pub fn max_size(&self) -> usize {
        self.inner.capacity()
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Add `key` as most recently used.
    ///
    /// Returns `false` when the key was already present; it is promoted and
    /// the size does not change.  Adding a new key to a full set evicts the
    /// least recently used key.
    pub fn add(&mut self, key: K) -> bool {
        !matches!(self.inner.insert(key, ()), Insertion::Updated(()))
    }

    /// Whether `key` is present.  A hit promotes the key.
    pub fn contains<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.contains(key)
    }

    /// Whether `key` is present, without changing its recency.
    pub fn peek_contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.peek_contains(key)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.inner.drain();
    }
}

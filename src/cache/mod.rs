//! In-memory bounded caching.
//!
//! Provides the single-threaded [`LruCache`] / [`LruSet`] eviction
//! structures and [`SharedLru`], the lock-guarded variant the resource
//! factory keeps its repository handles in.

pub mod lru;
pub mod shared;

pub use lru::{Insertion, LruCache, LruSet};
pub use shared::SharedLru;

//! Ephemeral key-value cache tier.
//!
//! The engine only relies on the primitives below, which map one-to-one to
//! Redis commands (`GET`, `SET EX`, `SET NX EX`, `INCR`, `EXISTS`, `EXPIRE`,
//! `DEL`, compare-and-delete, `ZADD`, `ZINCRBY`, `ZSCORE`, `ZREVRANK`,
//! `ZREVRANGE WITHSCORES`, `HSET`, `HGET`, `HGETALL`). Two implementations
//! ship with the crate:
//!
//! - [`MemoryCache`]: process-local, TTLs driven by an injectable [`Clock`](crate::clock::Clock)
//! - [`SqliteCache`]: tables in a SQLite file, so a CLI session survives restarts

mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::CacheError;

/// Primitives the progression engine needs from its cache tier.
///
/// Implementations must be safe to share between request threads. Every
/// call is a single round trip; callers never assume two calls are atomic
/// together.
pub trait CacheStore: Send + Sync {
    /// Unique identifier of the backend (e.g. "memory", "sqlite").
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set a string value with a time-to-live.
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Set only if the key is absent. Returns whether the value was written.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Increment an integer value, creating it at 1. Keeps an existing TTL.
    fn incr(&self, key: &str) -> Result<i64, CacheError>;

    fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Replace the TTL of an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete the key only if it still holds `expected`.
    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError>;

    /// Add `delta` to a member's score, creating it at `delta`.
    fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64, CacheError>;

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError>;

    /// 0-based position when ordered by score descending.
    fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>, CacheError>;

    /// Members with scores ordered by score descending, skipping `offset`
    /// entries and returning at most `limit`.
    fn zrevrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError>;

    fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError>;

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;
}

/// Redis ordering for `ZREVRANGE`: score descending, ties by member descending.
pub(crate) fn rev_order(a: &(String, f64), b: &(String, f64)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0))
}

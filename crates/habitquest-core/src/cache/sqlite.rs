//! SQLite-table cache backend.
//!
//! Keeps the cache tier in its own database file so a CLI session behaves
//! like a long-lived cache server: counters, flags and the leaderboard
//! survive between invocations and keys still expire on schedule.
//! Only string keys carry TTLs; sorted sets and hashes live until deleted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;

fn backend(err: rusqlite::Error) -> CacheError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::CannotOpen =>
        {
            CacheError::Unavailable(err.to_string())
        }
        _ => CacheError::Backend(err.to_string()),
    }
}

/// SQLite implementation of [`CacheStore`].
pub struct SqliteCache {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    /// Open (or create) the cache file at `path`.
    pub fn open_at(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    pub fn open_memory() -> Result<Self, CacheError> {
        Self::open_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        conn.busy_timeout(Duration::from_secs(2)).map_err(backend)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS cache_zset (
                key    TEXT NOT NULL,
                member TEXT NOT NULL,
                score  REAL NOT NULL,
                PRIMARY KEY (key, member)
            );

            CREATE TABLE IF NOT EXISTS cache_hash (
                key   TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE INDEX IF NOT EXISTS idx_cache_zset_score ON cache_zset(key, score);",
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Unavailable("sqlite cache poisoned".into()))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry_ms(&self, ttl: Duration) -> i64 {
        self.now_ms()
            .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Drop `key` if its TTL has passed.
    fn purge(&self, conn: &Connection, key: &str) -> Result<(), CacheError> {
        conn.execute(
            "DELETE FROM cache_kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, self.now_ms()],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn sorted_members(
        conn: &Connection,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        let mut stmt = conn
            .prepare(
                "SELECT member, score FROM cache_zset WHERE key = ?1
                 ORDER BY score DESC, member DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(backend)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![key, limit, offset], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

impl CacheStore for SqliteCache {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        conn.query_row(
            "SELECT value FROM cache_kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, self.expiry_ms(ttl)],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        let inserted = conn
            .execute(
                "INSERT INTO cache_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO NOTHING",
                params![key, value, self.expiry_ms(ttl)],
            )
            .map_err(backend)?;
        Ok(inserted > 0)
    }

    fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;
        self.purge(&tx, key)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM cache_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let next = match current {
            None => 1,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .and_then(|n| n.checked_add(1))
                .ok_or_else(|| CacheError::NotAnInteger { key: key.into() })?,
        };
        tx.execute(
            "INSERT INTO cache_kv (key, value, expires_at) VALUES (?1, ?2, NULL)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, next.to_string()],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(next)
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        let count: i64 = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM cache_kv WHERE key = ?1)
                      + (SELECT COUNT(*) FROM cache_zset WHERE key = ?1)
                      + (SELECT COUNT(*) FROM cache_hash WHERE key = ?1)",
                params![key],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        let changed = conn
            .execute(
                "UPDATE cache_kv SET expires_at = ?2 WHERE key = ?1",
                params![key, self.expiry_ms(ttl)],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn del(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        let mut removed = 0;
        for sql in [
            "DELETE FROM cache_kv WHERE key = ?1",
            "DELETE FROM cache_zset WHERE key = ?1",
            "DELETE FROM cache_hash WHERE key = ?1",
        ] {
            removed += conn.execute(sql, params![key]).map_err(backend)?;
        }
        Ok(removed > 0)
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let conn = self.conn()?;
        self.purge(&conn, key)?;
        let removed = conn
            .execute(
                "DELETE FROM cache_kv WHERE key = ?1 AND value = ?2",
                params![key, expected],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_zset (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT (key, member) DO UPDATE SET score = excluded.score",
            params![key, member, score],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64, CacheError> {
        let conn = self.conn()?;
        conn.query_row(
            "INSERT INTO cache_zset (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT (key, member) DO UPDATE SET score = score + excluded.score
             RETURNING score",
            params![key, member, delta],
            |row| row.get(0),
        )
        .map_err(backend)
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT score FROM cache_zset WHERE key = ?1 AND member = ?2",
            params![key, member],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)
    }

    fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>, CacheError> {
        let conn = self.conn()?;
        let rank: Option<i64> = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM cache_zset o
                         WHERE o.key = m.key
                           AND (o.score > m.score OR (o.score = m.score AND o.member > m.member)))
                 FROM cache_zset m WHERE m.key = ?1 AND m.member = ?2",
                params![key, member],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(rank.map(|r| r.max(0) as u64))
    }

    fn zrevrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        let conn = self.conn()?;
        Self::sorted_members(&conn, key, offset, limit)
    }

    fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        for (field, value) in fields {
            tx.execute(
                "INSERT INTO cache_hash (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM cache_hash WHERE key = ?1 AND field = ?2",
            params![key, field],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT field, value FROM cache_hash WHERE key = ?1")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(backend)?;
        rows.collect::<Result<HashMap<_, _>, _>>().map_err(backend)
    }
}

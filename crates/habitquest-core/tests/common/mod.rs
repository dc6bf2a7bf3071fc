//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use habitquest_core::cache::{CacheStore, MemoryCache};
use habitquest_core::clock::{Clock, ManualClock};
use habitquest_core::error::CacheError;
use habitquest_core::{
    Config, Difficulty, NewHabit, NewPacket, ProgressDb, ProgressionEngine, RecordingNotifier,
    RequestContext,
};

// ============================================================================
// Fault-injecting cache
// ============================================================================

/// Wraps [`MemoryCache`] and fails selected operations on demand.
pub struct FaultyCache {
    inner: MemoryCache,
    /// Key suffixes whose next string write fails once.
    fail_next_write: Mutex<Vec<String>>,
    sorted_sets_down: AtomicBool,
    down: AtomicBool,
}

impl FaultyCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryCache::with_clock(clock),
            fail_next_write: Mutex::new(Vec::new()),
            sorted_sets_down: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }
    }

    /// Fail the next `SET`/`INCR` on a key ending with `suffix`.
    pub fn fail_next_write_to(&self, suffix: &str) {
        self.fail_next_write.lock().unwrap().push(suffix.to_string());
    }

    pub fn set_sorted_sets_down(&self, down: bool) {
        self.sorted_sets_down.store(down, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn gate_zset(&self) -> Result<(), CacheError> {
        self.gate()?;
        if self.sorted_sets_down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected sorted set outage".into()));
        }
        Ok(())
    }

    fn gate_write(&self, key: &str) -> Result<(), CacheError> {
        self.gate()?;
        let mut armed = self.fail_next_write.lock().unwrap();
        if let Some(pos) = armed.iter().position(|suffix| key.ends_with(suffix.as_str())) {
            armed.remove(pos);
            return Err(CacheError::Unavailable(format!("injected failure writing {key}")));
        }
        Ok(())
    }
}

impl CacheStore for FaultyCache {
    fn name(&self) -> &str {
        "faulty"
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.gate()?;
        self.inner.get(key)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.gate_write(key)?;
        self.inner.set_ex(key, value, ttl)
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.gate_write(key)?;
        self.inner.set_nx_ex(key, value, ttl)
    }

    fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.gate_write(key)?;
        self.inner.incr(key)
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.exists(key)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.expire(key, ttl)
    }

    fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.del(key)
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.delete_if_eq(key, expected)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError> {
        self.gate_zset()?;
        self.inner.zadd(key, member, score)
    }

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64, CacheError> {
        self.gate_zset()?;
        self.inner.zincrby(key, member, delta)
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        self.gate_zset()?;
        self.inner.zscore(key, member)
    }

    fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>, CacheError> {
        self.gate_zset()?;
        self.inner.zrevrank(key, member)
    }

    fn zrevrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        self.gate_zset()?;
        self.inner.zrevrange_with_scores(key, offset, limit)
    }

    fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        self.gate()?;
        self.inner.hset(key, fields)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.gate()?;
        self.inner.hget(key, field)
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.gate()?;
        self.inner.hgetall(key)
    }
}

// ============================================================================
// Engine harness
// ============================================================================

pub struct Harness {
    pub engine: ProgressionEngine,
    pub db: Arc<ProgressDb>,
    pub cache: Arc<FaultyCache>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn ctx(&self) -> RequestContext {
        RequestContext::background()
    }

    pub fn next_day(&self) {
        self.clock.advance(chrono::Duration::days(1));
    }

    /// Journal lines recorded for `user_id`, in order.
    pub fn journal(&self, user_id: i64) -> Vec<String> {
        self.notifier
            .events()
            .into_iter()
            .filter_map(|n| match n {
                habitquest_core::Notification::Journal { user_id: u, text } if u == user_id => {
                    Some(text)
                }
                _ => None,
            })
            .collect()
    }
}

/// 09:00 on March 2nd 2026 in UTC+7.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap()
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let db = Arc::new(ProgressDb::open_memory().unwrap());
    let cache = Arc::new(FaultyCache::new(clock.clone()));
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = ProgressionEngine::builder(db.clone(), cache.clone(), config)
        .clock(clock.clone())
        .notifier(notifier.clone())
        .seed(7)
        .build()
        .unwrap();
    Harness {
        engine,
        db,
        cache,
        clock,
        notifier,
    }
}

pub fn habit(name: &str, difficulty: Difficulty) -> NewHabit {
    NewHabit {
        name: name.into(),
        description: String::new(),
        difficulty,
    }
}

pub fn packet(expected_task: i64, task_per_day: i64, habits: Vec<NewHabit>) -> NewPacket {
    NewPacket {
        name: "Greener mornings".into(),
        expected_task,
        task_per_day,
        habits,
    }
}

//! Process-local cache backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use super::{rev_order, CacheStore};
use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Placeholder left in the map while a writer owns the real entry.
    fn placeholder() -> Self {
        Self::new(Value::Str(String::new()), None)
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::WrongType { key: key.into() }
}

/// In-memory implementation of [`CacheStore`].
///
/// Keys live in a sharded [`DashMap`]. Every read-modify-write goes through
/// the map's entry API, so it runs under the key's shard lock and is atomic
/// per key while other keys proceed in parallel.
///
/// Expired keys are dropped lazily when touched. Time comes from the
/// injected clock, so tests can move across midnight without sleeping.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    /// Apply `f` to the live entry for `key`; `None` when absent or expired.
    fn read<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(f(entry.value()));
            }
            drop(entry);
            // A writer may have replaced it since the guard dropped.
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        None
    }

    /// Run `f` over the live slot for `key` while holding its shard lock.
    ///
    /// The slot is `None` for a missing or expired key. Whatever `f` leaves
    /// in it is stored; leaving `None` removes the key.
    fn write<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<Entry>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let mut slot = if occupied.get().is_expired(now) {
                    None
                } else {
                    Some(std::mem::replace(occupied.get_mut(), Entry::placeholder()))
                };
                let out = f(&mut slot);
                match slot {
                    Some(entry) => *occupied.get_mut() = entry,
                    None => {
                        occupied.remove();
                    }
                }
                out
            }
            MapEntry::Vacant(vacant) => {
                let mut slot = None;
                let out = f(&mut slot);
                if let Some(entry) = slot {
                    vacant.insert(entry);
                }
                out
            }
        }
    }

    fn read_zset<T>(
        &self,
        key: &str,
        f: impl FnOnce(&HashMap<String, f64>) -> T,
    ) -> Result<Option<T>, CacheError> {
        self.read(key, |entry| match &entry.value {
            Value::ZSet(set) => Ok(f(set)),
            _ => Err(wrong_type(key)),
        })
        .transpose()
    }

    fn sorted(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut rows: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        rows.sort_by(rev_order);
        rows
    }

    fn zincr_or_set(
        &self,
        key: &str,
        member: &str,
        amount: f64,
        increment: bool,
    ) -> Result<f64, CacheError> {
        self.write(key, |slot| {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::ZSet(HashMap::new()), None));
            let Value::ZSet(set) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let score = set.entry(member.to_string()).or_insert(0.0);
            if increment {
                *score += amount;
            } else {
                *score = amount;
            }
            Ok(*score)
        })
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.read(key, |entry| match &entry.value {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(wrong_type(key)),
        })
        .transpose()
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry::new(Value::Str(value.to_string()), self.expiry(ttl));
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let expires_at = self.expiry(ttl);
        self.write(key, |slot| {
            if slot.is_some() {
                return Ok(false);
            }
            *slot = Some(Entry::new(Value::Str(value.to_string()), expires_at));
            Ok(true)
        })
    }

    fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.write(key, |slot| match slot {
            None => {
                *slot = Some(Entry::new(Value::Str("1".into()), None));
                Ok(1)
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let next = s
                    .parse::<i64>()
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| CacheError::NotAnInteger { key: key.into() })?;
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.read(key, |_| ()).is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let expires_at = self.expiry(ttl);
        self.write(key, |slot| match slot {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.write(key, |slot| Ok(slot.take().is_some()))
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.write(key, |slot| {
            let matches = matches!(
                slot,
                Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected
            );
            if matches {
                *slot = None;
            }
            Ok(matches)
        })
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError> {
        self.zincr_or_set(key, member, score, false).map(|_| ())
    }

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64, CacheError> {
        self.zincr_or_set(key, member, delta, true)
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        Ok(self
            .read_zset(key, |set| set.get(member).copied())?
            .flatten())
    }

    fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>, CacheError> {
        Ok(self
            .read_zset(key, |set| {
                if !set.contains_key(member) {
                    return None;
                }
                Self::sorted(set)
                    .iter()
                    .position(|(m, _)| m == member)
                    .map(|p| p as u64)
            })?
            .flatten())
    }

    fn zrevrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        Ok(self
            .read_zset(key, |set| {
                Self::sorted(set)
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .collect()
            })?
            .unwrap_or_default())
    }

    fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        self.write(key, |slot| {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), None));
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            for (field, value) in fields {
                hash.insert((*field).to_string(), (*value).to_string());
            }
            Ok(())
        })
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.read(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.get(field).cloned()),
            _ => Err(wrong_type(key)),
        })
        .transpose()
        .map(Option::flatten)
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.read(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.clone()),
            _ => Err(wrong_type(key)),
        })
        .transpose()
        .map(Option::unwrap_or_default)
    }
}

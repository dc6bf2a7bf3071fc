//! Per-user mutual exclusion for multi-store flows.
//!
//! Completing a task or claiming a reward touches the durable store and the
//! cache in several round trips. Those flows run while holding the user's
//! lock, so two requests for the same user serialize while requests for
//! different users proceed in parallel.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{RequestContext, UserId};
use crate::cache::CacheStore;
use crate::error::{InfraError, Result, RuleViolation};
use crate::storage::LockConfig;

/// In-process keyed lock.
///
/// Only users currently holding the lock have an entry, so the set never
/// grows beyond the number of in-flight requests.
#[derive(Debug, Default)]
pub struct UserLocks {
    held: Mutex<HashSet<UserId>>,
    released: Condvar,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `user_id` is free, then hold it until the guard drops.
    ///
    /// # Errors
    /// [`InfraError::DeadlineExceeded`] if `deadline` passes while waiting.
    pub fn acquire(
        &self,
        user_id: UserId,
        deadline: Option<Instant>,
    ) -> Result<LockGuard<'_>, InfraError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while held.contains(&user_id) {
            held = match deadline {
                None => self
                    .released
                    .wait(held)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        tracing::warn!(user_id, "gave up waiting for user lock");
                        return Err(InfraError::DeadlineExceeded { stage: "user lock" });
                    }
                    self.released
                        .wait_timeout(held, left)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        held.insert(user_id);
        Ok(LockGuard {
            inner: GuardInner::InProcess {
                locks: self,
                user_id,
            },
        })
    }

    /// Number of users currently locked.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, user_id: UserId) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&user_id);
        drop(held);
        self.released.notify_all();
    }
}

/// Token lock held in the cache tier, for deployments with several
/// engine processes sharing one cache.
pub struct DistributedUserLock {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    attempts: u32,
    backoff: Duration,
}

fn lock_key(user_id: UserId) -> String {
    format!("lock:user:{user_id}")
}

impl DistributedUserLock {
    pub fn new(cache: Arc<dyn CacheStore>, config: &LockConfig) -> Self {
        Self {
            cache,
            ttl: Duration::from_secs(config.ttl_secs.max(1)),
            attempts: config.attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Try to take the lock, sleeping `backoff` between attempts.
    ///
    /// # Errors
    /// [`RuleViolation::LockContended`] once every attempt failed;
    /// infrastructure errors if the cache fails or the deadline passes.
    pub fn acquire(&self, ctx: &RequestContext, user_id: UserId) -> Result<LockGuard<'_>> {
        let key = lock_key(user_id);
        let token = uuid::Uuid::new_v4().to_string();

        for attempt in 0..self.attempts {
            ctx.check("user lock")?;
            if self.cache.set_nx_ex(&key, &token, self.ttl)? {
                return Ok(LockGuard {
                    inner: GuardInner::Distributed {
                        cache: self.cache.as_ref(),
                        key,
                        token,
                    },
                });
            }
            if attempt + 1 < self.attempts {
                std::thread::sleep(self.backoff);
            }
        }

        tracing::warn!(user_id, attempts = self.attempts, "user lock contended");
        Err(RuleViolation::LockContended { user_id }.into())
    }
}

/// How the engine serializes work per user.
pub enum LockStrategy {
    InProcess(UserLocks),
    Distributed(DistributedUserLock),
}

impl LockStrategy {
    pub fn from_config(cache: Arc<dyn CacheStore>, config: &LockConfig) -> Self {
        if config.distributed {
            LockStrategy::Distributed(DistributedUserLock::new(cache, config))
        } else {
            LockStrategy::InProcess(UserLocks::new())
        }
    }

    pub fn acquire(&self, ctx: &RequestContext, user_id: UserId) -> Result<LockGuard<'_>> {
        match self {
            LockStrategy::InProcess(locks) => {
                ctx.check("user lock")?;
                Ok(locks.acquire(user_id, ctx.deadline())?)
            }
            LockStrategy::Distributed(lock) => lock.acquire(ctx, user_id),
        }
    }
}

/// Releases the user's lock when dropped.
pub struct LockGuard<'a> {
    inner: GuardInner<'a>,
}

enum GuardInner<'a> {
    InProcess {
        locks: &'a UserLocks,
        user_id: UserId,
    },
    Distributed {
        cache: &'a dyn CacheStore,
        key: String,
        token: String,
    },
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match &self.inner {
            GuardInner::InProcess { locks, user_id } => locks.release(*user_id),
            GuardInner::Distributed { cache, key, token } => {
                // Compare-and-delete: never release a lock that expired and
                // was taken by someone else.
                match cache.delete_if_eq(key, token) {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(key = %key, "user lock expired before release"),
                    Err(e) => tracing::warn!(key = %key, error = %e, "failed to release user lock"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_user_serializes() {
        let locks = UserLocks::new();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let _guard = locks.acquire(1, None).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn different_users_do_not_block() {
        let locks = UserLocks::new();
        let _a = locks.acquire(1, None).unwrap();
        let _b = locks.acquire(2, None).unwrap();
        assert_eq!(locks.held_count(), 2);
    }

    #[test]
    fn waiting_stops_at_the_deadline() {
        let locks = UserLocks::new();
        let held = locks.acquire(1, None).unwrap();

        let started = Instant::now();
        let err = match locks.acquire(1, Some(started + Duration::from_millis(30))) {
            Ok(_) => panic!("lock is still held"),
            Err(e) => e,
        };
        assert!(matches!(err, InfraError::DeadlineExceeded { stage: "user lock" }));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(locks.held_count(), 1);

        drop(held);
        assert!(locks.acquire(1, Some(Instant::now() + Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn strategy_times_out_behind_a_slow_holder() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let strategy = LockStrategy::from_config(cache, &LockConfig::default());
        let _held = strategy.acquire(&RequestContext::background(), 4).unwrap();

        let ctx = RequestContext::with_timeout(Duration::from_millis(20));
        let err = match strategy.acquire(&ctx, 4) {
            Ok(_) => panic!("lock is still held"),
            Err(e) => e,
        };
        assert!(err.is_infrastructure());
    }

    fn distributed(cache: Arc<dyn CacheStore>) -> DistributedUserLock {
        DistributedUserLock::new(
            cache,
            &LockConfig {
                distributed: true,
                ttl_secs: 5,
                attempts: 3,
                backoff_ms: 1,
            },
        )
    }

    #[test]
    fn distributed_lock_fails_fast_when_held() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let lock = distributed(cache.clone());
        let ctx = RequestContext::background();

        let guard = lock.acquire(&ctx, 7).unwrap();
        let err = match lock.acquire(&ctx, 7) {
            Ok(_) => panic!("second acquire should fail"),
            Err(e) => e,
        };
        assert_eq!(err.rule(), Some(&RuleViolation::LockContended { user_id: 7 }));

        drop(guard);
        assert!(!cache.exists("lock:user:7").unwrap());
        assert!(lock.acquire(&ctx, 7).is_ok());
    }

    #[test]
    fn release_leaves_foreign_token_alone() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let lock = distributed(cache.clone());
        let guard = lock.acquire(&RequestContext::background(), 3).unwrap();
        // Simulate expiry followed by another holder.
        cache
            .set_ex("lock:user:3", "someone-else", Duration::from_secs(5))
            .unwrap();
        drop(guard);
        assert_eq!(
            cache.get("lock:user:3").unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[test]
    fn strategy_follows_config() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let strategy = LockStrategy::from_config(cache.clone(), &LockConfig::default());
        assert!(matches!(strategy, LockStrategy::InProcess(_)));
        let guard = strategy.acquire(&RequestContext::background(), 1).unwrap();
        drop(guard);

        let config = LockConfig {
            distributed: true,
            ..LockConfig::default()
        };
        let strategy = LockStrategy::from_config(cache, &config);
        assert!(matches!(strategy, LockStrategy::Distributed(_)));
    }
}

//! Daily check-in streaks kept in the cache tier.
//!
//! Three keys per user:
//! - `user:{id}:streak`: the counter, alive until the end of tomorrow
//! - `user:{id}:last_checkin`: local date of the last counted check-in
//! - `user:{id}:checkin_flag`: set once today is counted, expires at local midnight
//!
//! Missing a whole day lets the counter expire, so a broken streak reads as
//! zero without any sweeper. The counter and flag are written in separate
//! round trips; a crash between them makes the retry count the day again,
//! which over-counts by at most one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{RequestContext, UserId};
use crate::cache::CacheStore;
use crate::clock::DayClock;
use crate::error::{CacheError, Result};
use crate::storage::ProgressDb;

/// Where a user stands relative to today's check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakState {
    NeverCheckedIn,
    CheckedInToday,
    /// Last check-in was yesterday; the streak is alive until tonight.
    AwaitingToday,
    /// A day was missed; the next check-in starts over at 1.
    Stale,
}

/// Outcome of [`StreakTracker::check_in`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakCheckIn {
    pub streak: i64,
    /// Today had already been counted; nothing was written.
    pub already_checked_in: bool,
}

pub struct StreakTracker {
    cache: Arc<dyn CacheStore>,
    db: Arc<ProgressDb>,
    days: DayClock,
}

fn counter_key(user_id: UserId) -> String {
    format!("user:{user_id}:streak")
}

fn last_key(user_id: UserId) -> String {
    format!("user:{user_id}:last_checkin")
}

fn flag_key(user_id: UserId) -> String {
    format!("user:{user_id}:checkin_flag")
}

impl StreakTracker {
    pub fn new(cache: Arc<dyn CacheStore>, db: Arc<ProgressDb>, days: DayClock) -> Self {
        Self { cache, db, days }
    }

    /// Count today for `user_id`.
    ///
    /// Checking in twice on the same local day is a success that returns the
    /// current streak unchanged.
    ///
    /// # Errors
    /// Cache or database failures are returned as infrastructure errors and
    /// are not retried.
    pub fn check_in(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<StreakCheckIn> {
        let today = self.days.today(now);
        let yesterday = self.days.yesterday(now);

        ctx.check("streak flag")?;
        if self.cache.exists(&flag_key(user_id))? {
            let streak = self.current_streak(ctx, user_id)?;
            return Ok(StreakCheckIn {
                streak,
                already_checked_in: true,
            });
        }

        let last = self.last_check_in(ctx, user_id)?;
        let keep_alive = Duration::from_secs(self.days.seconds_until_end_of_tomorrow(now));

        ctx.check("streak counter")?;
        let streak = if last == Some(today) {
            // Counted earlier but the flag never landed; only restore the flag.
            self.current_streak(ctx, user_id)?.max(1)
        } else if last == Some(yesterday) {
            let streak = self.cache.incr(&counter_key(user_id))?;
            self.cache.expire(&counter_key(user_id), keep_alive)?;
            streak
        } else {
            self.cache.set_ex(&counter_key(user_id), "1", keep_alive)?;
            1
        };

        ctx.check("streak last check-in")?;
        self.cache.set_ex(
            &last_key(user_id),
            &today.format("%Y-%m-%d").to_string(),
            keep_alive,
        )?;

        ctx.check("streak flag")?;
        let until_midnight = Duration::from_secs(self.days.seconds_until_midnight(now));
        self.cache.set_ex(&flag_key(user_id), "1", until_midnight)?;

        ctx.check("longest streak")?;
        if self.db.raise_longest_streak(user_id, streak)? {
            tracing::debug!(user_id, streak, "longest streak raised");
        }
        tracing::debug!(user_id, streak, %today, "checked in");

        Ok(StreakCheckIn {
            streak,
            already_checked_in: false,
        })
    }

    /// The live streak; an expired or missing counter reads as 0.
    pub fn current_streak(&self, ctx: &RequestContext, user_id: UserId) -> Result<i64> {
        ctx.check("streak counter")?;
        let key = counter_key(user_id);
        match self.cache.get(&key)? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| CacheError::NotAnInteger { key }.into()),
        }
    }

    pub fn state(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<StreakState> {
        ctx.check("streak flag")?;
        if self.cache.exists(&flag_key(user_id))? {
            return Ok(StreakState::CheckedInToday);
        }

        match self.last_check_in(ctx, user_id)? {
            Some(day) if day == self.days.today(now) => Ok(StreakState::CheckedInToday),
            Some(day) if day == self.days.yesterday(now) => Ok(StreakState::AwaitingToday),
            Some(_) => Ok(StreakState::Stale),
            None => {
                // The cache forgets old check-ins; the durable high-water mark doesn't.
                ctx.check("longest streak")?;
                let ever = self
                    .db
                    .profile(user_id)?
                    .is_some_and(|p| p.longest_streak > 0);
                Ok(if ever {
                    StreakState::Stale
                } else {
                    StreakState::NeverCheckedIn
                })
            }
        }
    }

    fn last_check_in(&self, ctx: &RequestContext, user_id: UserId) -> Result<Option<NaiveDate>> {
        ctx.check("streak last check-in")?;
        let key = last_key(user_id);
        match self.cache.get(&key)? {
            None => Ok(None),
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| CacheError::WrongType { key }.into()),
        }
    }
}

//! Unlocking harder habits as a packet progresses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Difficulty, Habit, Packet, RequestContext, StreakTracker, UserId};
use crate::error::Result;
use crate::notify::Notifier;
use crate::storage::{ProgressDb, UnlockConfig};

/// A habit that moved from locked to unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HabitUnlocked {
    pub user_id: UserId,
    pub packet_id: i64,
    pub habit_id: i64,
    pub habit_name: String,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnlockOutcome {
    pub events: Vec<HabitUnlocked>,
}

impl UnlockOutcome {
    pub fn did_unlock(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Whole-percent completion of a packet, rounded down; 0 before anything
/// is assigned.
pub fn completion_rate(completed: i64, assigned: i64) -> i64 {
    if assigned <= 0 {
        return 0;
    }
    completed * 100 / assigned
}

pub struct HabitUnlockEngine {
    db: Arc<ProgressDb>,
    streaks: Arc<StreakTracker>,
    config: UnlockConfig,
    notifier: Arc<dyn Notifier>,
}

impl HabitUnlockEngine {
    pub fn new(
        db: Arc<ProgressDb>,
        streaks: Arc<StreakTracker>,
        config: UnlockConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            streaks,
            config,
            notifier,
        }
    }

    /// Whether a locked habit qualifies at this completion rate and streak.
    pub fn qualifies(&self, habit: &Habit, completion_rate: i64, streak: i64) -> bool {
        match habit.difficulty {
            Difficulty::Easy => false,
            Difficulty::Normal => {
                completion_rate >= self.config.normal_rate && streak >= self.config.normal_streak
            }
            Difficulty::Hard => {
                completion_rate >= self.config.hard_rate && streak >= self.config.hard_streak
            }
        }
    }

    /// Unlock every locked habit of `packet` the user now qualifies for.
    ///
    /// The completion rate is `completed_task * 100 / assigned` in integer
    /// percent, where the
    /// assigned count is read from the task table rather than trusted from
    /// any counter. Nothing happens before the first task is assigned.
    pub fn evaluate(
        &self,
        ctx: &RequestContext,
        packet: &Packet,
        user_id: UserId,
    ) -> Result<UnlockOutcome> {
        ctx.check("assigned tasks")?;
        let assigned = self.db.count_assigned_tasks(user_id, packet.id)?;
        if assigned == 0 {
            return Ok(UnlockOutcome::default());
        }
        let completion_rate = completion_rate(packet.completed_task, assigned);
        let streak = self.streaks.current_streak(ctx, user_id)?;

        ctx.check("locked habits")?;
        let candidates = self.db.locked_habits(packet.id)?;

        let mut outcome = UnlockOutcome::default();
        for habit in candidates
            .iter()
            .filter(|h| self.qualifies(h, completion_rate, streak))
        {
            ctx.check("habit unlock")?;
            if !self.db.unlock_habit(habit.id)? {
                continue;
            }
            let event = HabitUnlocked {
                user_id,
                packet_id: packet.id,
                habit_id: habit.id,
                habit_name: habit.name.clone(),
                difficulty: habit.difficulty,
            };
            tracing::info!(
                user_id,
                habit_id = habit.id,
                difficulty = %habit.difficulty,
                completion_rate,
                streak,
                "habit unlocked"
            );
            self.notifier.habit_unlocked(&event)?;
            outcome.events.push(event);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCache};
    use crate::clock::DayClock;
    use crate::notify::{Notification, RecordingNotifier};
    use crate::storage::NewHabit;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    struct Fixture {
        db: Arc<ProgressDb>,
        cache: Arc<dyn CacheStore>,
        engine: HabitUnlockEngine,
        notifier: Arc<RecordingNotifier>,
        packet: Packet,
        habits: Vec<Habit>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let db = Arc::new(ProgressDb::open_memory().unwrap());
        db.create_profile(1, "ayu", "", 100).unwrap();
        let new = |name: &str, difficulty| NewHabit {
            name: name.into(),
            description: String::new(),
            difficulty,
        };
        let (packet, habits) = db
            .create_packet(
                1,
                "Morning",
                20,
                2,
                &[
                    new("Stretch", Difficulty::Easy),
                    new("Journal", Difficulty::Normal),
                    new("Run 5k", Difficulty::Hard),
                ],
                |_| 10,
                now(),
            )
            .unwrap();
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let streaks = Arc::new(StreakTracker::new(cache.clone(), db.clone(), DayClock::utc()));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = HabitUnlockEngine::new(
            db.clone(),
            streaks,
            UnlockConfig::default(),
            notifier.clone(),
        );
        Fixture {
            db,
            cache,
            engine,
            notifier,
            packet,
            habits,
        }
    }

    /// Assign `count` tasks on distinct days, then report `completed` done.
    fn with_progress(f: &Fixture, count: i64, completed: i64) -> Packet {
        let mut task_ids = Vec::new();
        for offset in 0..count {
            let day = (now() + Duration::days(offset)).date_naive();
            f.db.insert_task_if_absent(1, &f.habits[0], day, now()).unwrap();
            task_ids.extend(f.db.tasks_for_day(1, day).unwrap().iter().map(|t| t.id));
        }
        for id in task_ids.into_iter().take(completed as usize) {
            f.db.commit_task_completion(1, id, 0).unwrap().unwrap();
        }
        f.db.packet(f.packet.id).unwrap().unwrap()
    }

    fn set_streak(f: &Fixture, streak: i64) {
        f.cache
            .set_ex("user:1:streak", &streak.to_string(), std::time::Duration::from_secs(3600))
            .unwrap();
    }

    #[test]
    fn nothing_before_first_assignment() {
        let f = fixture();
        set_streak(&f, 10);
        let outcome = f
            .engine
            .evaluate(&RequestContext::background(), &f.packet, 1)
            .unwrap();
        assert!(!outcome.did_unlock());
    }

    #[test]
    fn normal_unlocks_at_half_with_three_day_streak() {
        let f = fixture();
        let packet = with_progress(&f, 4, 2);
        set_streak(&f, 3);
        let outcome = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert!(outcome.did_unlock());
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].difficulty, Difficulty::Normal);
        assert!(f.db.locked_habits(packet.id).unwrap().iter().all(|h| h.difficulty == Difficulty::Hard));
    }

    #[test]
    fn hard_needs_seventy_percent_and_five_days() {
        let f = fixture();
        let packet = with_progress(&f, 10, 7);
        set_streak(&f, 4);
        let first = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert_eq!(first.events.len(), 1, "only the normal habit at streak 4");

        set_streak(&f, 5);
        let second = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].difficulty, Difficulty::Hard);
        assert!(f.db.locked_habits(packet.id).unwrap().is_empty());
    }

    #[test]
    fn completion_rate_rounds_down() {
        assert_eq!(completion_rate(2, 3), 66);
        assert_eq!(completion_rate(7, 10), 70);
        assert_eq!(completion_rate(0, 0), 0);
    }

    #[test]
    fn two_of_three_misses_a_sixty_seven_percent_bar() {
        let mut f = fixture();
        f.engine.config.normal_rate = 67;
        let packet = with_progress(&f, 3, 2);
        set_streak(&f, 10);
        let outcome = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert!(!outcome.did_unlock());

        f.engine.config.normal_rate = 66;
        let outcome = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn low_rate_unlocks_nothing() {
        let f = fixture();
        let packet = with_progress(&f, 10, 4);
        set_streak(&f, 30);
        let outcome = f
            .engine
            .evaluate(&RequestContext::background(), &packet, 1)
            .unwrap();
        assert!(!outcome.did_unlock());
    }

    #[test]
    fn each_habit_unlocks_once_and_is_announced() {
        let f = fixture();
        let packet = with_progress(&f, 10, 10);
        set_streak(&f, 9);
        let ctx = RequestContext::background();
        assert_eq!(f.engine.evaluate(&ctx, &packet, 1).unwrap().events.len(), 2);
        assert!(!f.engine.evaluate(&ctx, &packet, 1).unwrap().did_unlock());

        let announced = f
            .notifier
            .events()
            .into_iter()
            .filter(|n| matches!(n, Notification::HabitUnlocked(_)))
            .count();
        assert_eq!(announced, 2);
    }
}

//! Request-level flows composed from the progression components.
//!
//! [`ProgressionEngine`] owns both storage tiers and every component, and is
//! shared by all request threads (`Send + Sync`). Flows that read and write
//! several stores run under the per-user lock.

use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_pcg::Mcg128Xsl64;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::clock::{Clock, DayClock, SystemClock};
use crate::error::{CoreError, Result, RuleViolation, ValidationError};
use crate::notify::{JournalNotifier, Notifier};
use crate::progression::{
    completion_rate, exp_needed_for, pick_n, ExperienceLedger, Habit, HabitUnlockEngine,
    Leaderboard, LevelProgress, LockStrategy, Packet, PointLedger, Profile, RequestContext,
    StreakCheckIn, StreakTracker, Task, UnlockOutcome, UserId,
};
use crate::storage::{CompletedTask, Config, NewHabit, ProgressDb};

/// A packet to create, with its habit templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPacket {
    pub name: String,
    /// Tasks to complete before the packet is done.
    pub expected_task: i64,
    pub task_per_day: i64,
    pub habits: Vec<NewHabit>,
}

/// Where a point reward comes from (quest, treasure, challenge, event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardSource {
    pub name: String,
    pub category: String,
    pub base_points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketCreated {
    pub packet: Packet,
    pub habits: Vec<Habit>,
    pub streak: StreakCheckIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task: Task,
    pub packet: Packet,
    /// This completion finished the packet.
    pub packet_completed: bool,
    pub progress: LevelProgress,
    pub unlocks: UnlockOutcome,
    pub streak: StreakCheckIn,
    /// Every task assigned today is now done.
    pub all_done_today: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardClaim {
    pub profile: Profile,
    /// Points credited after the multiplier.
    pub awarded: i64,
    pub streak: StreakCheckIn,
}

/// Builder for [`ProgressionEngine`]; defaults to the system clock, the
/// journal notifier and an entropy-seeded RNG.
pub struct EngineBuilder {
    db: Arc<ProgressDb>,
    cache: Arc<dyn CacheStore>,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn Notifier>>,
    seed: Option<u64>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Fix the task sampler's seed for reproducible assignments.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// # Errors
    /// Fails if the configuration does not validate.
    pub fn build(self) -> Result<ProgressionEngine> {
        self.config.validate()?;
        let days = self.config.day_clock()?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(JournalNotifier::new(self.db.clone(), clock.clone())),
        };
        let rng = match self.seed {
            Some(seed) => Mcg128Xsl64::seed_from_u64(seed),
            None => Mcg128Xsl64::from_entropy(),
        };

        let leaderboard = Arc::new(Leaderboard::new(
            self.cache.clone(),
            self.config.leaderboard.key.clone(),
        ));
        let streaks = Arc::new(StreakTracker::new(self.cache.clone(), self.db.clone(), days));
        let experience = ExperienceLedger::new(
            self.db.clone(),
            self.config.experience.clone(),
            notifier.clone(),
        );
        let points = PointLedger::new(self.db.clone(), leaderboard.clone(), clock.clone());
        let unlocks = HabitUnlockEngine::new(
            self.db.clone(),
            streaks.clone(),
            self.config.unlock.clone(),
            notifier.clone(),
        );
        let locks = LockStrategy::from_config(self.cache.clone(), &self.config.lock);

        Ok(ProgressionEngine {
            db: self.db,
            config: self.config,
            clock,
            days,
            notifier,
            leaderboard,
            streaks,
            experience,
            points,
            unlocks,
            locks,
            rng: Mutex::new(rng),
        })
    }
}

pub struct ProgressionEngine {
    db: Arc<ProgressDb>,
    config: Config,
    clock: Arc<dyn Clock>,
    days: DayClock,
    notifier: Arc<dyn Notifier>,
    leaderboard: Arc<Leaderboard>,
    streaks: Arc<StreakTracker>,
    experience: ExperienceLedger,
    points: PointLedger,
    unlocks: HabitUnlockEngine,
    locks: LockStrategy,
    rng: Mutex<Mcg128Xsl64>,
}

impl ProgressionEngine {
    pub fn builder(db: Arc<ProgressDb>, cache: Arc<dyn CacheStore>, config: Config) -> EngineBuilder {
        EngineBuilder {
            db,
            cache,
            config,
            clock: None,
            notifier: None,
            seed: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &ProgressDb {
        &self.db
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    pub fn streaks(&self) -> &StreakTracker {
        &self.streaks
    }

    pub fn experience(&self) -> &ExperienceLedger {
        &self.experience
    }

    pub fn points(&self) -> &PointLedger {
        &self.points
    }

    pub fn unlocks(&self) -> &HabitUnlockEngine {
        &self.unlocks
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Create the profile and its leaderboard entry (score 0).
    ///
    /// Registering an existing user keeps the stored profile and only
    /// refreshes the leaderboard metadata.
    pub fn register_user(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        name: &str,
        avatar_url: &str,
    ) -> Result<Profile> {
        ctx.check("profile create")?;
        let exp_needed = exp_needed_for(1, &self.config.experience);
        let profile = self
            .db
            .create_profile(user_id, name, avatar_url, exp_needed)?;

        if self.leaderboard.score(ctx, user_id)?.is_none() {
            self.leaderboard.upsert_score(ctx, user_id, 0)?;
        }
        self.leaderboard
            .set_member_info(ctx, user_id, &profile.name, &profile.avatar_url)?;
        tracing::debug!(user_id, "user registered");
        Ok(profile)
    }

    pub fn profile(&self, ctx: &RequestContext, user_id: UserId) -> Result<Profile> {
        ctx.check("profile read")?;
        Ok(self
            .db
            .profile(user_id)?
            .ok_or(RuleViolation::ProfileNotFound { user_id })?)
    }

    /// Change name and avatar, then re-sync the leaderboard metadata.
    pub fn update_display(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        name: &str,
        avatar_url: &str,
    ) -> Result<Profile> {
        ctx.check("profile update")?;
        let profile = self
            .db
            .update_display(user_id, name, avatar_url)?
            .ok_or(RuleViolation::ProfileNotFound { user_id })?;
        self.leaderboard
            .set_member_info(ctx, user_id, &profile.name, &profile.avatar_url)?;
        Ok(profile)
    }

    /// Create a packet and its habits. Easy habits start unlocked, the rest
    /// locked; weights come from configuration. Counts as a check-in.
    pub fn create_packet(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        new: &NewPacket,
    ) -> Result<PacketCreated> {
        validate_packet(new)?;
        self.profile(ctx, user_id)?;

        let now = self.clock.now();
        ctx.check("packet create")?;
        let weights = &self.config.habit_weights;
        let (packet, habits) = self.db.create_packet(
            user_id,
            &new.name,
            new.expected_task,
            new.task_per_day,
            &new.habits,
            |difficulty| weights.weight_for(difficulty),
            now,
        )?;
        tracing::debug!(user_id, packet_id = packet.id, habits = habits.len(), "packet created");

        self.notifier
            .journal(user_id, &format!("Started a new packet: {}", packet.name))?;
        let streak = self.streaks.check_in(ctx, user_id, now)?;

        Ok(PacketCreated {
            packet,
            habits,
            streak,
        })
    }

    /// Today's tasks, sampling them from the active packet's unlocked habits
    /// on the first call of the day.
    ///
    /// At most `min(task_per_day, remaining tasks)` are assigned. A habit is
    /// assigned to a user at most once per day; concurrent callers converge
    /// on the same set.
    pub fn assign_daily_tasks(&self, ctx: &RequestContext, user_id: UserId) -> Result<Vec<Task>> {
        let _guard = self.locks.acquire(ctx, user_id)?;
        let now = self.clock.now();
        let today = self.days.today(now);

        ctx.check("today's tasks")?;
        let existing = self.db.tasks_for_day(user_id, today)?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        ctx.check("active packet")?;
        let packet = self
            .db
            .active_packet(user_id)?
            .ok_or(RuleViolation::NoActivePacket { user_id })?;
        let count = packet.task_per_day.min(packet.remaining_tasks());
        if count <= 0 {
            return Ok(Vec::new());
        }

        ctx.check("unlocked habits")?;
        let pool = self.db.unlocked_habits(packet.id)?;
        let picked = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            pick_n(&pool, count as usize, &mut *rng)?
        };

        for habit in &picked {
            ctx.check("task insert")?;
            self.db.insert_task_if_absent(user_id, habit, today, now)?;
        }
        tracing::debug!(user_id, packet_id = packet.id, count = picked.len(), %today, "tasks assigned");

        ctx.check("today's tasks")?;
        Ok(self.db.tasks_for_day(user_id, today)?)
    }

    pub fn tasks_today(&self, ctx: &RequestContext, user_id: UserId) -> Result<Vec<Task>> {
        ctx.check("today's tasks")?;
        let today = self.days.today(self.clock.now());
        Ok(self.db.tasks_for_day(user_id, today)?)
    }

    /// Complete one task and apply everything that follows from it: packet
    /// progress, experience, habit unlocks, the day's check-in and journal
    /// lines.
    ///
    /// The task flag, packet counter and experience gain commit in one
    /// transaction. The remaining steps run afterwards and the task is
    /// marked settled once they all succeed. Calling again for a completed
    /// but unsettled task re-runs those steps instead of failing, so a cache
    /// outage part way through can be retried.
    ///
    /// # Errors
    /// [`RuleViolation::TaskNotFound`] for a missing or foreign task,
    /// [`RuleViolation::TaskAlreadyCompleted`] when it was done and settled
    /// before.
    pub fn complete_task(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        task_id: i64,
    ) -> Result<TaskCompletion> {
        let _guard = self.locks.acquire(ctx, user_id)?;
        let now = self.clock.now();

        ctx.check("task read")?;
        let existing = self
            .db
            .task(task_id)?
            .filter(|t| t.user_id == user_id)
            .ok_or(RuleViolation::TaskNotFound { task_id })?;

        let completed = if existing.completed {
            ctx.check("task settlement")?;
            let unsettled = self
                .db
                .unsettled_completion(user_id, task_id)?
                .ok_or(RuleViolation::TaskAlreadyCompleted { task_id })?;
            tracing::info!(user_id, task_id, "resuming unsettled task completion");
            unsettled
        } else {
            ctx.check("task complete")?;
            let gain = self.config.experience.gain_for(existing.difficulty);
            self.db
                .commit_task_completion(user_id, task_id, gain)?
                .ok_or(RuleViolation::TaskAlreadyCompleted { task_id })?
        };

        self.settle_completion(ctx, user_id, completed, now)
    }

    /// Every step of a task completion after the durable commit. Each one
    /// tolerates having run before.
    fn settle_completion(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        completed: CompletedTask,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<TaskCompletion> {
        let CompletedTask {
            task,
            packet,
            closed_packet,
        } = completed;

        let progress = self.experience.settle(ctx, user_id)?;
        let unlocks = self.unlocks.evaluate(ctx, &packet, user_id)?;
        let streak = self.streaks.check_in(ctx, user_id, now)?;

        if closed_packet {
            ctx.check("assigned tasks")?;
            let assigned = self.db.count_assigned_tasks(user_id, packet.id)?;
            let rate = completion_rate(packet.completed_task, assigned);
            tracing::info!(user_id, packet_id = packet.id, rate, "packet completed");
            self.notifier.journal(
                user_id,
                &format!(
                    "Completed packet {} with a completion rate of {rate}%",
                    packet.name
                ),
            )?;
        }

        ctx.check("today's tasks")?;
        let all_done_today = self
            .db
            .tasks_for_day(user_id, task.assigned_on)?
            .iter()
            .all(|t| t.completed);
        if all_done_today {
            self.notifier
                .journal(user_id, "Finished every task for today!")?;
        }

        ctx.check("task settlement")?;
        self.db.settle_task(task.id)?;

        Ok(TaskCompletion {
            task,
            packet,
            packet_completed: closed_packet,
            progress,
            unlocks,
            streak,
            all_done_today,
        })
    }

    /// Credit a reward with the multiplier at the user's current level and
    /// streak, then count the day.
    ///
    /// The check-in runs first, so a cache failure there leaves nothing
    /// credited and the claim can be retried. The leaderboard is synced
    /// last; if that fails the balance and journal stand and the error is
    /// [`crate::error::InfraError::LeaderboardDesync`], repaired by
    /// [`ProgressionEngine::reconcile_leaderboard`].
    pub fn claim_reward(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        source: &RewardSource,
    ) -> Result<RewardClaim> {
        let _guard = self.locks.acquire(ctx, user_id)?;
        let before = self.profile(ctx, user_id)?;
        let streak_now = self.streaks.current_streak(ctx, user_id)?;
        let streak = self.streaks.check_in(ctx, user_id, self.clock.now())?;

        let (profile, awarded) = self.points.credit(
            ctx,
            user_id,
            source.base_points,
            &source.name,
            &source.category,
            before.level,
            streak_now,
        )?;
        self.notifier.journal(
            user_id,
            &format!("Earned {awarded} points from {}", source.name),
        )?;
        self.points.sync_leaderboard(ctx, user_id, awarded)?;

        Ok(RewardClaim {
            profile,
            awarded,
            streak,
        })
    }

    /// Spend `amount * conversion_rate` points.
    pub fn convert_points(&self, ctx: &RequestContext, user_id: UserId, amount: i64) -> Result<Profile> {
        if amount <= 0 {
            return Err(ValidationError::InvalidValue {
                field: "amount".into(),
                message: format!("conversion amount must be positive, got {amount}"),
            }
            .into());
        }
        let cost = amount
            .checked_mul(self.config.points.conversion_rate)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "amount".into(),
                message: format!("conversion of {amount} units overflows"),
            })?;

        let _guard = self.locks.acquire(ctx, user_id)?;
        let profile = self.points.spend(ctx, user_id, cost, "convert")?;
        self.notifier.journal(
            user_id,
            &format!("Converted {cost} points into {amount} units"),
        )?;
        Ok(profile)
    }

    /// Rebuild every leaderboard score and its metadata from the durable
    /// store. Idempotent; returns how many users were written.
    pub fn reconcile_leaderboard(&self, ctx: &RequestContext) -> Result<usize> {
        ctx.check("reconcile")?;
        let earned = self.db.earned_points()?;
        let profiles = self.db.all_profiles()?;

        for (user_id, total) in &earned {
            self.leaderboard.upsert_score(ctx, *user_id, *total)?;
        }
        for profile in &profiles {
            self.leaderboard
                .set_member_info(ctx, profile.user_id, &profile.name, &profile.avatar_url)?;
        }
        tracing::info!(users = earned.len(), "leaderboard reconciled");
        Ok(earned.len())
    }
}

fn validate_packet(new: &NewPacket) -> Result<(), CoreError> {
    let invalid = |field: &str, message: String| -> CoreError {
        ValidationError::InvalidValue {
            field: field.into(),
            message,
        }
        .into()
    };
    if new.name.trim().is_empty() {
        return Err(invalid("name", "packet name must not be empty".into()));
    }
    if new.expected_task <= 0 {
        return Err(invalid(
            "expected_task",
            format!("must be positive, got {}", new.expected_task),
        ));
    }
    if new.task_per_day <= 0 {
        return Err(invalid(
            "task_per_day",
            format!("must be positive, got {}", new.task_per_day),
        ));
    }
    if new.habits.is_empty() {
        return Err(invalid("habits", "a packet needs at least one habit".into()));
    }
    Ok(())
}

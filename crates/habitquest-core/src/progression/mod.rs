//! The progression engine components.
//!
//! Leaves first: [`multiplier`] and [`sampler`] are pure; [`streak`],
//! [`experience`], [`points`], [`unlock`] and [`leaderboard`] each wrap one
//! or both storage tiers; [`lock`] provides the per-user exclusion scope the
//! multi-store flows run under.

pub mod context;
pub mod experience;
pub mod leaderboard;
pub mod lock;
pub mod multiplier;
pub mod points;
pub mod sampler;
pub mod streak;
pub mod unlock;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use context::RequestContext;
pub use experience::{exp_needed_for, ExperienceLedger, LevelProgress};
pub use leaderboard::{Leaderboard, LeaderboardRow};
pub use lock::{DistributedUserLock, LockGuard, LockStrategy, UserLocks};
pub use multiplier::multiplier;
pub use points::PointLedger;
pub use sampler::pick_n;
pub use streak::{StreakCheckIn, StreakState, StreakTracker};
pub use unlock::{completion_rate, HabitUnlockEngine, HabitUnlocked, UnlockOutcome};

/// Identifier of a user across both storage tiers.
pub type UserId = i64;

/// Habit and task difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Normal,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Normal => "normal",
            Difficulty::Hard => "hard",
        }
    }

    /// Easy habits start unlocked; everything else must be earned.
    pub fn starts_locked(&self) -> bool {
        !matches!(self, Difficulty::Easy)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Difficulty::Easy),
            "normal" => Ok(Difficulty::Normal),
            "hard" => Ok(Difficulty::Hard),
            other => Err(ValidationError::InvalidValue {
                field: "difficulty".into(),
                message: format!("unknown difficulty '{other}'"),
            }),
        }
    }
}

/// Durable per-user progression state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub level: i64,
    pub current_exp: i64,
    pub exp_needed: i64,
    pub points: i64,
    pub longest_streak: i64,
}

/// A recurring activity template owned by a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: i64,
    pub packet_id: i64,
    pub name: String,
    pub description: String,
    pub difficulty: Difficulty,
    /// Sampling weight; only the sampler reads it.
    pub weight: i64,
    pub locked: bool,
}

/// One assignment of a habit to a user on a calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: UserId,
    pub packet_id: i64,
    pub habit_id: i64,
    pub name: String,
    pub difficulty: Difficulty,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub assigned_on: NaiveDate,
}

/// A multi-day goal composed of habits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: i64,
    pub user_id: UserId,
    pub name: String,
    pub expected_task: i64,
    pub completed_task: i64,
    pub task_per_day: i64,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl Packet {
    /// Tasks still needed before the packet is complete.
    pub fn remaining_tasks(&self) -> i64 {
        (self.expected_task - self.completed_task).max(0)
    }
}

//! # HabitQuest Core Library
//!
//! The progression engine of the HabitQuest habit tracker: everything that
//! turns completed tasks and claimed rewards into streaks, experience,
//! levels, points, unlocked habits and a global ranking.
//!
//! ## Architecture
//!
//! - **Storage**: SQLite durable store for profiles, packets, habits, tasks,
//!   point history and the journal, plus TOML configuration
//! - **Cache**: a Redis-shaped key-value tier for streak counters, check-in
//!   flags, per-user locks and the leaderboard sorted set
//! - **Progression**: the components built on top of both tiers
//! - **Engine**: request-level flows that compose the components under a
//!   per-user lock
//!
//! The durable store is authoritative. When a flow commits durably but fails
//! to update the cache, the error says so and
//! [`ProgressionEngine::reconcile_leaderboard`] rebuilds the cache-side
//! state.
//!
//! ## Key Components
//!
//! - [`ProgressionEngine`]: entry point for every flow
//! - [`ProgressDb`]: durable persistence
//! - [`CacheStore`]: cache tier abstraction ([`MemoryCache`], [`SqliteCache`])
//! - [`Config`]: engine configuration
//! - [`Notifier`]: level-up, unlock and journal events

pub mod cache;
pub mod clock;
pub mod engine;
pub mod error;
pub mod notify;
pub mod progression;
pub mod storage;

pub use cache::{CacheStore, MemoryCache, SqliteCache};
pub use clock::{Clock, DayClock, ManualClock, SystemClock};
pub use engine::{
    EngineBuilder, NewPacket, PacketCreated, ProgressionEngine, RewardClaim, RewardSource,
    TaskCompletion,
};
pub use error::{
    CacheError, ConfigError, CoreError, DatabaseError, InfraError, RuleViolation, ValidationError,
};
pub use notify::{JournalNotifier, Notification, Notifier, RecordingNotifier};
pub use progression::{
    Difficulty, Habit, HabitUnlocked, LeaderboardRow, LevelProgress, Packet, Profile,
    RequestContext, StreakCheckIn, StreakState, Task, UnlockOutcome, UserId,
};
pub use storage::{Config, HistoryKind, HistoryRecord, JournalEntry, NewHabit, ProgressDb};

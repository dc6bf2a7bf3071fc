//! Progression events delivered to the outside world.
//!
//! The engine reports level-ups, habit unlocks and journal lines through a
//! [`Notifier`]. [`JournalNotifier`] turns all three into system lines in
//! the durable journal; [`RecordingNotifier`] keeps them in memory for
//! embedding applications and tests.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Result;
use crate::progression::{HabitUnlocked, UserId};
use crate::storage::ProgressDb;

/// Receiver of progression events.
pub trait Notifier: Send + Sync {
    /// The user reached `level`. Called once per level crossed.
    fn level_up(&self, user_id: UserId, level: i64) -> Result<()>;

    fn habit_unlocked(&self, event: &HabitUnlocked) -> Result<()>;

    /// A free-form system line for the user's journal.
    fn journal(&self, user_id: UserId, text: &str) -> Result<()>;
}

/// Writes every event to the durable journal as a system line.
pub struct JournalNotifier {
    db: Arc<ProgressDb>,
    clock: Arc<dyn Clock>,
}

impl JournalNotifier {
    pub fn new(db: Arc<ProgressDb>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl Notifier for JournalNotifier {
    fn level_up(&self, user_id: UserId, level: i64) -> Result<()> {
        self.journal(user_id, &format!("Reached level {level}"))
    }

    fn habit_unlocked(&self, event: &HabitUnlocked) -> Result<()> {
        self.journal(
            event.user_id,
            &format!("Unlocked {} habit \"{}\"", event.difficulty, event.habit_name),
        )
    }

    fn journal(&self, user_id: UserId, text: &str) -> Result<()> {
        self.db
            .append_journal(user_id, text, true, self.clock.now())?;
        Ok(())
    }
}

/// One event captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    LevelUp { user_id: UserId, level: i64 },
    HabitUnlocked(HabitUnlocked),
    Journal { user_id: UserId, text: String },
}

/// Keeps events in memory in the order they were raised.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Levels announced for `user_id`, in order.
    pub fn levels(&self, user_id: UserId) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::LevelUp { user_id: u, level } if u == user_id => Some(level),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

impl Notifier for RecordingNotifier {
    fn level_up(&self, user_id: UserId, level: i64) -> Result<()> {
        self.push(Notification::LevelUp { user_id, level });
        Ok(())
    }

    fn habit_unlocked(&self, event: &HabitUnlocked) -> Result<()> {
        self.push(Notification::HabitUnlocked(event.clone()));
        Ok(())
    }

    fn journal(&self, user_id: UserId, text: &str) -> Result<()> {
        self.push(Notification::Journal {
            user_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

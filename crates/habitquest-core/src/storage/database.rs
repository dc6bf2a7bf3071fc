//! SQLite-based durable storage.
//!
//! Provides persistent storage for:
//! - Profiles (level, experience, points, longest streak)
//! - Packets, their habits, and the daily task instances
//! - Append-only point history and the system journal
//!
//! Every counter mutation is a single `UPDATE ... SET col = col + ?`
//! statement, so concurrent writers never lose increments.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{data_dir, migrations};
use crate::error::DatabaseError;
use crate::progression::{Difficulty, Habit, Packet, Profile, Task, UserId};

const PROFILE_COLUMNS: &str =
    "user_id, name, avatar_url, level, current_exp, exp_needed, points, longest_streak";
const PACKET_COLUMNS: &str =
    "id, user_id, name, expected_task, completed_task, task_per_day, completed, created_at";
const HABIT_COLUMNS: &str = "id, packet_id, name, description, difficulty, weight, locked";
const TASK_COLUMNS: &str =
    "id, user_id, packet_id, habit_id, name, difficulty, completed, created_at, assigned_on";

/// Direction of a point movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Input,
    Output,
}

impl HistoryKind {
    fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Input => "input",
            HistoryKind::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub user_id: UserId,
    pub name: String,
    pub category: String,
    pub kind: HistoryKind,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub user_id: UserId,
    pub text: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable outcome of completing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub task: Task,
    pub packet: Packet,
    /// This completion brought the packet to its target.
    pub closed_packet: bool,
}

/// Habit definition supplied when a packet is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHabit {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub difficulty: Difficulty,
}

// === Helper Functions ===

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn parse_difficulty(row: &Row<'_>, idx: usize) -> rusqlite::Result<Difficulty> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn insert_history(
    conn: &Connection,
    user_id: UserId,
    name: &str,
    category: &str,
    kind: HistoryKind,
    amount: i64,
    at: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO history (user_id, name, category, kind, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![user_id, name, category, kind.as_str(), amount, at.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_profile(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        user_id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        level: row.get(3)?,
        current_exp: row.get(4)?,
        exp_needed: row.get(5)?,
        points: row.get(6)?,
        longest_streak: row.get(7)?,
    })
}

fn map_packet(row: &Row<'_>) -> rusqlite::Result<Packet> {
    Ok(Packet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        expected_task: row.get(3)?,
        completed_task: row.get(4)?,
        task_per_day: row.get(5)?,
        completed: row.get(6)?,
        created_at: parse_datetime(row, 7)?,
    })
}

fn map_habit(row: &Row<'_>) -> rusqlite::Result<Habit> {
    Ok(Habit {
        id: row.get(0)?,
        packet_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        difficulty: parse_difficulty(row, 4)?,
        weight: row.get(5)?,
        locked: row.get(6)?,
    })
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        packet_id: row.get(2)?,
        habit_id: row.get(3)?,
        name: row.get(4)?,
        difficulty: parse_difficulty(row, 5)?,
        completed: row.get(6)?,
        created_at: parse_datetime(row, 7)?,
        assigned_on: parse_date(row, 8)?,
    })
}

/// SQLite database for durable progression state.
///
/// The connection sits behind a mutex so one `ProgressDb` can be shared by
/// every request thread.
pub struct ProgressDb {
    conn: Mutex<Connection>,
}

impl ProgressDb {
    /// Open the database at `~/.config/habitquest/habitquest.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, DatabaseError> {
        let dir = data_dir().map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        Self::open_at(&dir.join("habitquest.db"))
    }

    /// Open (or create) the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Poisoned)
    }

    // === Profiles ===

    /// Create a profile unless one exists; returns the stored row either way.
    pub fn create_profile(
        &self,
        user_id: UserId,
        name: &str,
        avatar_url: &str,
        exp_needed: i64,
    ) -> Result<Profile, DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO profiles (user_id, name, avatar_url, exp_needed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id) DO NOTHING",
            params![user_id, name, avatar_url, exp_needed],
        )?;
        let profile = conn.query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
            params![user_id],
            map_profile,
        )?;
        Ok(profile)
    }

    pub fn profile(&self, user_id: UserId) -> Result<Option<Profile>, DatabaseError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
                params![user_id],
                map_profile,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn all_profiles(&self) -> Result<Vec<Profile>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY user_id"))?;
        let rows = stmt.query_map([], map_profile)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_display(
        &self,
        user_id: UserId,
        name: &str,
        avatar_url: &str,
    ) -> Result<Option<Profile>, DatabaseError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!(
                    "UPDATE profiles SET name = ?2, avatar_url = ?3 WHERE user_id = ?1
                     RETURNING {PROFILE_COLUMNS}"
                ),
                params![user_id, name, avatar_url],
                map_profile,
            )
            .optional()?;
        Ok(profile)
    }

    /// Add `amount` points and record the matching `input` history row in
    /// one transaction. `None` when the profile is missing.
    pub fn credit_points(
        &self,
        user_id: UserId,
        amount: i64,
        name: &str,
        category: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Profile>, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let profile = tx
            .query_row(
                &format!(
                    "UPDATE profiles SET points = points + ?2 WHERE user_id = ?1
                     RETURNING {PROFILE_COLUMNS}"
                ),
                params![user_id, amount],
                map_profile,
            )
            .optional()?;
        if profile.is_some() {
            insert_history(&tx, user_id, name, category, HistoryKind::Input, amount, at)?;
        }
        tx.commit()?;
        Ok(profile)
    }

    /// Subtract `amount` points if the balance covers it, recording an
    /// `output` history row in the same transaction. `None` when the balance
    /// is too low or the profile is missing.
    pub fn debit_points(
        &self,
        user_id: UserId,
        amount: i64,
        name: &str,
        category: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Profile>, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let profile = tx
            .query_row(
                &format!(
                    "UPDATE profiles SET points = points - ?2
                     WHERE user_id = ?1 AND points >= ?2
                     RETURNING {PROFILE_COLUMNS}"
                ),
                params![user_id, amount],
                map_profile,
            )
            .optional()?;
        if profile.is_some() {
            insert_history(&tx, user_id, name, category, HistoryKind::Output, amount, at)?;
        }
        tx.commit()?;
        Ok(profile)
    }

    /// Atomically add experience without levelling.
    pub fn add_exp(&self, user_id: UserId, gain: i64) -> Result<Option<Profile>, DatabaseError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!(
                    "UPDATE profiles SET current_exp = current_exp + ?2 WHERE user_id = ?1
                     RETURNING {PROFILE_COLUMNS}"
                ),
                params![user_id, gain],
                map_profile,
            )
            .optional()?;
        Ok(profile)
    }

    /// Clear one level: consume `exp_needed`, bump the level and store the
    /// next requirement. Only applies while the stored exp still covers the
    /// stored requirement, so a concurrent caller cannot clear it twice.
    pub fn apply_level_up(
        &self,
        user_id: UserId,
        next_exp_needed: i64,
    ) -> Result<Option<Profile>, DatabaseError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!(
                    "UPDATE profiles
                     SET current_exp = current_exp - exp_needed,
                         level = level + 1,
                         exp_needed = ?2
                     WHERE user_id = ?1 AND current_exp >= exp_needed
                     RETURNING {PROFILE_COLUMNS}"
                ),
                params![user_id, next_exp_needed],
                map_profile,
            )
            .optional()?;
        Ok(profile)
    }

    /// Raise the high-water mark; returns whether it moved.
    pub fn raise_longest_streak(&self, user_id: UserId, streak: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE profiles SET longest_streak = ?2
             WHERE user_id = ?1 AND longest_streak < ?2",
            params![user_id, streak],
        )?;
        Ok(changed > 0)
    }

    // === History ===

    pub fn append_history(
        &self,
        user_id: UserId,
        name: &str,
        category: &str,
        kind: HistoryKind,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        insert_history(&conn, user_id, name, category, kind, amount, at)
    }

    pub fn history(&self, user_id: UserId) -> Result<Vec<HistoryRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, category, kind, amount, created_at
             FROM history WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let kind: String = row.get(4)?;
            Ok(HistoryRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                name: row.get(2)?,
                category: row.get(3)?,
                kind: if kind == "output" {
                    HistoryKind::Output
                } else {
                    HistoryKind::Input
                },
                amount: row.get(5)?,
                created_at: parse_datetime(row, 6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Cumulative earned points per profile, the leaderboard's source of truth.
    pub fn earned_points(&self) -> Result<Vec<(UserId, i64)>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.user_id, COALESCE(SUM(h.amount), 0)
             FROM profiles p
             LEFT JOIN history h ON h.user_id = p.user_id AND h.kind = 'input'
             GROUP BY p.user_id
             ORDER BY p.user_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // === Journal ===

    pub fn append_journal(
        &self,
        user_id: UserId,
        text: &str,
        is_system: bool,
        at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO journal (user_id, text, is_system, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, text, is_system, at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn journal(&self, user_id: UserId) -> Result<Vec<JournalEntry>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, text, is_system, created_at
             FROM journal WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                text: row.get(2)?,
                is_system: row.get(3)?,
                created_at: parse_datetime(row, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // === Packets and habits ===

    /// Insert a packet with its habits in one transaction. `weight_for`
    /// supplies each habit's sampling weight; easy habits start unlocked.
    pub fn create_packet(
        &self,
        user_id: UserId,
        name: &str,
        expected_task: i64,
        task_per_day: i64,
        habits: &[NewHabit],
        weight_for: impl Fn(Difficulty) -> i64,
        at: DateTime<Utc>,
    ) -> Result<(Packet, Vec<Habit>), DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let packet = tx.query_row(
            &format!(
                "INSERT INTO packets (user_id, name, expected_task, task_per_day, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING {PACKET_COLUMNS}"
            ),
            params![user_id, name, expected_task, task_per_day, at.to_rfc3339()],
            map_packet,
        )?;

        let mut created = Vec::with_capacity(habits.len());
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO habits (packet_id, name, description, difficulty, weight, locked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 RETURNING {HABIT_COLUMNS}"
            ))?;
            for habit in habits {
                let row = stmt.query_row(
                    params![
                        packet.id,
                        habit.name,
                        habit.description,
                        habit.difficulty.as_str(),
                        weight_for(habit.difficulty),
                        habit.difficulty.starts_locked(),
                    ],
                    map_habit,
                )?;
                created.push(row);
            }
        }

        tx.commit()?;
        Ok((packet, created))
    }

    pub fn packet(&self, packet_id: i64) -> Result<Option<Packet>, DatabaseError> {
        let conn = self.conn()?;
        let packet = conn
            .query_row(
                &format!("SELECT {PACKET_COLUMNS} FROM packets WHERE id = ?1"),
                params![packet_id],
                map_packet,
            )
            .optional()?;
        Ok(packet)
    }

    /// The user's most recent packet that is not yet completed.
    pub fn active_packet(&self, user_id: UserId) -> Result<Option<Packet>, DatabaseError> {
        let conn = self.conn()?;
        let packet = conn
            .query_row(
                &format!(
                    "SELECT {PACKET_COLUMNS} FROM packets
                     WHERE user_id = ?1 AND completed = 0
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_id],
                map_packet,
            )
            .optional()?;
        Ok(packet)
    }

    pub fn packets(&self, user_id: UserId) -> Result<Vec<Packet>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PACKET_COLUMNS} FROM packets WHERE user_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![user_id], map_packet)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn habits(&self, packet_id: i64) -> Result<Vec<Habit>, DatabaseError> {
        self.habits_where(packet_id, None)
    }

    pub fn locked_habits(&self, packet_id: i64) -> Result<Vec<Habit>, DatabaseError> {
        self.habits_where(packet_id, Some(true))
    }

    pub fn unlocked_habits(&self, packet_id: i64) -> Result<Vec<Habit>, DatabaseError> {
        self.habits_where(packet_id, Some(false))
    }

    fn habits_where(&self, packet_id: i64, locked: Option<bool>) -> Result<Vec<Habit>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HABIT_COLUMNS} FROM habits
             WHERE packet_id = ?1 AND (?2 IS NULL OR locked = ?2)
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![packet_id, locked], map_habit)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// One-way locked → unlocked transition. Returns whether this call
    /// performed it.
    pub fn unlock_habit(&self, habit_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE habits SET locked = 0 WHERE id = ?1 AND locked = 1",
            params![habit_id],
        )?;
        Ok(changed > 0)
    }

    // === Tasks ===

    /// Number of tasks ever assigned to the user for this packet.
    pub fn count_assigned_tasks(&self, user_id: UserId, packet_id: i64) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND packet_id = ?2",
            params![user_id, packet_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn tasks_for_day(&self, user_id: UserId, day: NaiveDate) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE user_id = ?1 AND assigned_on = ?2
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![user_id, format_date(day)], map_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert a task unless this habit was already assigned to the user
    /// on `day`. Returns whether a row was created.
    pub fn insert_task_if_absent(
        &self,
        user_id: UserId,
        habit: &Habit,
        day: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO tasks (user_id, packet_id, habit_id, name, difficulty, created_at, assigned_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (habit_id, user_id, assigned_on) DO NOTHING",
            params![
                user_id,
                habit.packet_id,
                habit.id,
                habit.name,
                habit.difficulty.as_str(),
                at.to_rfc3339(),
                format_date(day),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn task(&self, task_id: i64) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                map_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Complete a task durably in one transaction: the task's false → true
    /// transition, the packet counter (closing the packet when it reaches
    /// its target) and the experience gain.
    ///
    /// The task stays unsettled until [`ProgressDb::settle_task`] runs.
    /// `None` if the task is missing, foreign or already completed; nothing
    /// is written then.
    pub fn commit_task_completion(
        &self,
        user_id: UserId,
        task_id: i64,
        exp_gain: i64,
    ) -> Result<Option<CompletedTask>, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(task) = tx
            .query_row(
                &format!(
                    "UPDATE tasks SET completed = 1, settled = 0
                     WHERE id = ?1 AND user_id = ?2 AND completed = 0
                     RETURNING {TASK_COLUMNS}"
                ),
                params![task_id, user_id],
                map_task,
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut packet = tx.query_row(
            &format!(
                "UPDATE packets SET completed_task = completed_task + 1 WHERE id = ?1
                 RETURNING {PACKET_COLUMNS}"
            ),
            params![task.packet_id],
            map_packet,
        )?;

        let closed_packet = packet.completed_task >= packet.expected_task
            && tx.execute(
                "UPDATE packets SET completed = 1 WHERE id = ?1 AND completed = 0",
                params![packet.id],
            )? > 0;
        if closed_packet {
            packet.completed = true;
            tx.execute(
                "UPDATE tasks SET closed_packet = 1 WHERE id = ?1",
                params![task.id],
            )?;
        }

        let changed = tx.execute(
            "UPDATE profiles SET current_exp = current_exp + ?2 WHERE user_id = ?1",
            params![user_id, exp_gain],
        )?;
        if changed == 0 {
            return Err(DatabaseError::QueryFailed(format!(
                "profile {user_id} missing for task {task_id}"
            )));
        }

        tx.commit()?;
        Ok(Some(CompletedTask {
            task,
            packet,
            closed_packet,
        }))
    }

    /// A completed task whose follow-up steps have not finished yet.
    pub fn unsettled_completion(
        &self,
        user_id: UserId,
        task_id: i64,
    ) -> Result<Option<CompletedTask>, DatabaseError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS}, closed_packet FROM tasks
                     WHERE id = ?1 AND user_id = ?2 AND completed = 1 AND settled = 0"
                ),
                params![task_id, user_id],
                |row| Ok((map_task(row)?, row.get::<_, bool>(9)?)),
            )
            .optional()?;
        let Some((task, closed_packet)) = found else {
            return Ok(None);
        };
        let packet = conn.query_row(
            &format!("SELECT {PACKET_COLUMNS} FROM packets WHERE id = ?1"),
            params![task.packet_id],
            map_packet,
        )?;
        Ok(Some(CompletedTask {
            task,
            packet,
            closed_packet,
        }))
    }

    /// Record that every follow-up of the task's completion has run.
    pub fn settle_task(&self, task_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET settled = 1 WHERE id = ?1 AND completed = 1 AND settled = 0",
            params![task_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn habit(name: &str, difficulty: Difficulty) -> NewHabit {
        NewHabit {
            name: name.into(),
            description: String::new(),
            difficulty,
        }
    }

    fn seeded() -> (ProgressDb, Packet, Vec<Habit>) {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 100).unwrap();
        let (packet, habits) = db
            .create_packet(
                1,
                "Less plastic",
                10,
                2,
                &[
                    habit("Bring a bottle", Difficulty::Easy),
                    habit("Refill station", Difficulty::Normal),
                    habit("Zero-waste week", Difficulty::Hard),
                ],
                |d| match d {
                    Difficulty::Easy => 70,
                    Difficulty::Normal => 25,
                    Difficulty::Hard => 5,
                },
                now(),
            )
            .unwrap();
        (db, packet, habits)
    }

    #[test]
    fn create_profile_is_idempotent() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(7, "first", "", 100).unwrap();
        let again = db.create_profile(7, "second", "", 100).unwrap();
        assert_eq!(again.name, "first");
        assert_eq!(again.level, 1);
        assert_eq!(again.points, 0);
    }

    #[test]
    fn points_credit_and_guarded_debit_write_history() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 100).unwrap();
        let credited = db.credit_points(1, 40, "quest", "quest", now()).unwrap();
        assert_eq!(credited.unwrap().points, 40);
        assert!(db.debit_points(1, 41, "convert", "convert", now()).unwrap().is_none());
        let debited = db.debit_points(1, 40, "convert", "convert", now()).unwrap();
        assert_eq!(debited.unwrap().points, 0);
        assert!(db.credit_points(99, 1, "quest", "quest", now()).unwrap().is_none());

        let kinds: Vec<_> = db.history(1).unwrap().iter().map(|h| h.kind).collect();
        assert_eq!(kinds, vec![HistoryKind::Input, HistoryKind::Output]);
        assert!(db.history(99).unwrap().is_empty());
    }

    #[test]
    fn level_up_requires_enough_exp() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 50).unwrap();
        db.add_exp(1, 49).unwrap();
        assert!(db.apply_level_up(1, 50).unwrap().is_none());
        db.add_exp(1, 1).unwrap();
        let profile = db.apply_level_up(1, 80).unwrap().unwrap();
        assert_eq!((profile.level, profile.current_exp, profile.exp_needed), (2, 0, 80));
    }

    #[test]
    fn longest_streak_only_rises() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 100).unwrap();
        assert!(db.raise_longest_streak(1, 4).unwrap());
        assert!(!db.raise_longest_streak(1, 3).unwrap());
        assert_eq!(db.profile(1).unwrap().unwrap().longest_streak, 4);
    }

    #[test]
    fn packet_habits_start_locked_by_difficulty() {
        let (db, packet, habits) = seeded();
        assert_eq!(habits.len(), 3);
        assert!(!habits[0].locked);
        assert!(habits[1].locked && habits[2].locked);
        assert_eq!(habits[0].weight, 70);
        assert_eq!(db.unlocked_habits(packet.id).unwrap().len(), 1);
        assert_eq!(db.locked_habits(packet.id).unwrap().len(), 2);
        assert_eq!(db.active_packet(1).unwrap().unwrap().id, packet.id);
    }

    #[test]
    fn unlock_is_one_way_and_reports_transition() {
        let (db, _packet, habits) = seeded();
        assert!(db.unlock_habit(habits[1].id).unwrap());
        assert!(!db.unlock_habit(habits[1].id).unwrap());
    }

    #[test]
    fn one_task_per_habit_user_and_day() {
        let (db, packet, habits) = seeded();
        let day = now().date_naive();
        assert!(db.insert_task_if_absent(1, &habits[0], day, now()).unwrap());
        assert!(!db.insert_task_if_absent(1, &habits[0], day, now()).unwrap());
        let next = day.succ_opt().unwrap();
        assert!(db.insert_task_if_absent(1, &habits[0], next, now()).unwrap());
        assert_eq!(db.tasks_for_day(1, day).unwrap().len(), 1);
        assert_eq!(db.count_assigned_tasks(1, packet.id).unwrap(), 2);
    }

    #[test]
    fn task_completion_commits_counter_and_exp_together() {
        let (db, packet, habits) = seeded();
        let day = now().date_naive();
        db.insert_task_if_absent(1, &habits[0], day, now()).unwrap();
        let task = db.tasks_for_day(1, day).unwrap().remove(0);

        assert!(db.commit_task_completion(2, task.id, 10).unwrap().is_none());
        let done = db.commit_task_completion(1, task.id, 10).unwrap().unwrap();
        assert!(done.task.completed);
        assert_eq!(done.packet.completed_task, 1);
        assert!(!done.closed_packet);
        assert_eq!(db.profile(1).unwrap().unwrap().current_exp, 10);

        assert!(db.commit_task_completion(1, task.id, 10).unwrap().is_none());
        assert_eq!(db.packet(packet.id).unwrap().unwrap().completed_task, 1);
        assert_eq!(db.profile(1).unwrap().unwrap().current_exp, 10);
    }

    #[test]
    fn completion_stays_unsettled_until_settled() {
        let (db, _packet, habits) = seeded();
        let day = now().date_naive();
        db.insert_task_if_absent(1, &habits[0], day, now()).unwrap();
        let task = db.tasks_for_day(1, day).unwrap().remove(0);
        assert!(db.unsettled_completion(1, task.id).unwrap().is_none());

        let done = db.commit_task_completion(1, task.id, 10).unwrap().unwrap();
        assert_eq!(db.unsettled_completion(1, task.id).unwrap(), Some(done));
        assert!(db.unsettled_completion(2, task.id).unwrap().is_none());

        assert!(db.settle_task(task.id).unwrap());
        assert!(!db.settle_task(task.id).unwrap());
        assert!(db.unsettled_completion(1, task.id).unwrap().is_none());
    }

    #[test]
    fn last_completion_closes_the_packet() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 100).unwrap();
        let (packet, habits) = db
            .create_packet(1, "Short", 1, 1, &[habit("Walk", Difficulty::Easy)], |_| 1, now())
            .unwrap();
        let day = now().date_naive();
        db.insert_task_if_absent(1, &habits[0], day, now()).unwrap();
        let task = db.tasks_for_day(1, day).unwrap().remove(0);

        let done = db.commit_task_completion(1, task.id, 10).unwrap().unwrap();
        assert!(done.closed_packet);
        assert!(done.packet.completed);
        assert!(db.packet(packet.id).unwrap().unwrap().completed);
        assert!(db.active_packet(1).unwrap().is_none());
        assert!(db.unsettled_completion(1, task.id).unwrap().unwrap().closed_packet);
    }

    #[test]
    fn earned_points_sum_inputs_only() {
        let db = ProgressDb::open_memory().unwrap();
        db.create_profile(1, "ayu", "", 100).unwrap();
        db.create_profile(2, "bima", "", 100).unwrap();
        db.append_history(1, "quest", "quest", HistoryKind::Input, 30, now()).unwrap();
        db.append_history(1, "convert", "convert", HistoryKind::Output, 20, now()).unwrap();
        db.append_history(1, "treasure", "treasure", HistoryKind::Input, 5, now()).unwrap();
        assert_eq!(db.earned_points().unwrap(), vec![(1, 35), (2, 0)]);
        assert_eq!(db.history(1).unwrap().len(), 3);
    }

    #[test]
    fn journal_round_trip() {
        let db = ProgressDb::open_memory().unwrap();
        db.append_journal(3, "Reached level 2", true, now()).unwrap();
        let entries = db.journal(3).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Reached level 2");
        assert!(entries[0].is_system);
    }
}

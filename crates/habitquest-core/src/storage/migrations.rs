//! Database schema migrations for habitquest.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 4;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }
    if current_version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    Ok(conn
        .query_row("SELECT version FROM schema_version", [], |row| {
            row.get::<_, i32>(0)
        })
        .optional()?
        .unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: profiles, packets, habits and tasks.
///
/// `points >= 0` is enforced by the schema as well as by the guarded
/// decrement, and a habit can be assigned to a user at most once per day.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS profiles (
            user_id        INTEGER PRIMARY KEY,
            name           TEXT NOT NULL,
            avatar_url     TEXT NOT NULL DEFAULT '',
            level          INTEGER NOT NULL DEFAULT 1 CHECK (level >= 1),
            current_exp    INTEGER NOT NULL DEFAULT 0,
            exp_needed     INTEGER NOT NULL CHECK (exp_needed > 0),
            points         INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
            longest_streak INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS packets (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL REFERENCES profiles(user_id),
            name           TEXT NOT NULL,
            expected_task  INTEGER NOT NULL,
            completed_task INTEGER NOT NULL DEFAULT 0,
            task_per_day   INTEGER NOT NULL,
            completed      INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS habits (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            packet_id   INTEGER NOT NULL REFERENCES packets(id),
            name        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            difficulty  TEXT NOT NULL CHECK (difficulty IN ('easy', 'normal', 'hard')),
            weight      INTEGER NOT NULL,
            locked      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES profiles(user_id),
            packet_id   INTEGER NOT NULL REFERENCES packets(id),
            habit_id    INTEGER NOT NULL REFERENCES habits(id),
            name        TEXT NOT NULL,
            difficulty  TEXT NOT NULL,
            completed   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            assigned_on TEXT NOT NULL,
            UNIQUE (habit_id, user_id, assigned_on)
        );",
    )?;
    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: append-only point history and the system journal.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS history (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL REFERENCES profiles(user_id),
            name       TEXT NOT NULL,
            category   TEXT NOT NULL,
            kind       TEXT NOT NULL CHECK (kind IN ('input', 'output')),
            amount     INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS journal (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL,
            text       TEXT NOT NULL,
            is_system  INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );",
    )?;
    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Migration v3: indexes for the per-request lookups.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_tasks_user_day ON tasks(user_id, assigned_on);
         CREATE INDEX IF NOT EXISTS idx_tasks_user_packet ON tasks(user_id, packet_id);
         CREATE INDEX IF NOT EXISTS idx_habits_packet_locked ON habits(packet_id, locked);
         CREATE INDEX IF NOT EXISTS idx_packets_user_completed ON packets(user_id, completed);
         CREATE INDEX IF NOT EXISTS idx_history_user_kind ON history(user_id, kind);
         CREATE INDEX IF NOT EXISTS idx_journal_user ON journal(user_id);",
    )?;
    set_schema_version(&tx, 3)?;
    tx.commit()
}

/// Migration v4: completion follow-up tracking on tasks.
///
/// `settled` flips once every step after the durable completion has run;
/// `closed_packet` remembers that this completion finished its packet.
/// Rows completed before this version count as settled.
fn migrate_v4(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "ALTER TABLE tasks ADD COLUMN settled INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE tasks ADD COLUMN closed_packet INTEGER NOT NULL DEFAULT 0;
         UPDATE tasks SET settled = 1 WHERE completed = 1;",
    )?;
    set_schema_version(&tx, 4)?;
    tx.commit()
}

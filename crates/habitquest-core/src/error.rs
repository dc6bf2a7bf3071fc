//! Core error types for habitquest-core.
//!
//! Errors fall into three families that callers handle differently:
//! validation failures (bad input, never retried), infrastructure failures
//! (a store was unreachable or too slow, propagated untouched), and business
//! rule violations (typed outcomes such as an insufficient balance that a
//! request handler renders without string matching).

use std::path::PathBuf;
use thiserror::Error;

use crate::progression::UserId;

/// Core error type for habitquest-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input rejected before touching any store
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A storage tier failed or the request deadline elapsed
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] InfraError),

    /// A typed business outcome the caller is expected to render
    #[error("{0}")]
    Rule(#[from] RuleViolation),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// The rule violation carried by this error, if any.
    pub fn rule(&self) -> Option<&RuleViolation> {
        match self {
            CoreError::Rule(rule) => Some(rule),
            _ => None,
        }
    }

    /// Whether the failure came from a storage tier or an elapsed deadline.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, CoreError::Infrastructure(_))
    }
}

/// Validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Sampling weight must be a positive integer
    #[error("Habit {habit_id} has invalid sampling weight {weight}; weights must be >= 1")]
    InvalidWeight { habit_id: i64, weight: i64 },

    /// Amount must not be negative
    #[error("Invalid amount for '{field}': {value} is negative")]
    NegativeAmount { field: String, value: i64 },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Storage-tier failures. The engine never retries these internally.
#[derive(Error, Debug)]
pub enum InfraError {
    /// Durable store failure
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Cache store failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The caller's deadline elapsed before the next storage round trip
    #[error("Deadline exceeded before {stage}")]
    DeadlineExceeded { stage: &'static str },

    /// The durable write committed but the leaderboard could not be updated.
    /// The durable store stays authoritative; reconciliation repairs the cache.
    #[error("Leaderboard out of sync for user {user_id} after durable write: {source}")]
    LeaderboardDesync {
        user_id: UserId,
        #[source]
        source: CacheError,
    },
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A connection mutex was poisoned by a panicking thread
    #[error("Database connection poisoned")]
    Poisoned,
}

/// Cache-specific errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The cache could not be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// INCR on a value that is not an integer
    #[error("Value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    /// A key holds a different data type than the command expects
    #[error("Key '{key}' holds the wrong kind of value")]
    WrongType { key: String },

    /// Backend-specific failure
    #[error("Cache backend failure: {0}")]
    Backend(String),
}

/// Business outcomes returned as typed errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    /// Not enough points for a spend
    #[error("Insufficient balance: {available} points available, {requested} requested")]
    InsufficientBalance { available: i64, requested: i64 },

    /// The user has no leaderboard score
    #[error("User {user_id} is not ranked")]
    NotRanked { user_id: UserId },

    /// No profile row for the user
    #[error("No profile for user {user_id}")]
    ProfileNotFound { user_id: UserId },

    /// Task does not exist or belongs to another user
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    /// Task was completed earlier
    #[error("Task {task_id} already completed")]
    TaskAlreadyCompleted { task_id: i64 },

    /// The user has no packet in progress
    #[error("User {user_id} has no active packet")]
    NoActivePacket { user_id: UserId },

    /// Another request holds this user's lock
    #[error("Another request is already updating user {user_id}")]
    LockContended { user_id: UserId },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg) => {
                if code.code == rusqlite::ErrorCode::DatabaseLocked
                    || code.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for InfraError {
    fn from(err: rusqlite::Error) -> Self {
        InfraError::Database(err.into())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Infrastructure(err.into())
    }
}

impl From<DatabaseError> for CoreError {
    fn from(err: DatabaseError) -> Self {
        CoreError::Infrastructure(InfraError::Database(err))
    }
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        CoreError::Infrastructure(InfraError::Cache(err))
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

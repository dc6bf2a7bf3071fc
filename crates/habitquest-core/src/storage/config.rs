//! TOML-based engine configuration.
//!
//! Holds the tunables of the progression engine:
//! - The single application-wide timezone used for every day boundary
//! - Experience curve constants and per-difficulty exp gains
//! - Habit unlock thresholds and default sampling weights
//! - Point conversion rate and leaderboard key
//! - Per-user lock timing
//!
//! Configuration is stored at `~/.config/habitquest/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::clock::DayClock;
use crate::error::ConfigError;
use crate::progression::Difficulty;

/// Experience curve configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperienceConfig {
    #[serde(default = "default_base_exp")]
    pub base_exp: f64,
    #[serde(default = "default_exp_factor")]
    pub exp_factor: f64,
    #[serde(default = "default_easy_gain")]
    pub easy_gain: i64,
    #[serde(default = "default_normal_gain")]
    pub normal_gain: i64,
    #[serde(default = "default_hard_gain")]
    pub hard_gain: i64,
}

/// Habit unlock thresholds (completion rate in whole percent, streak in days).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnlockConfig {
    #[serde(default = "default_normal_rate")]
    pub normal_rate: i64,
    #[serde(default = "default_normal_streak")]
    pub normal_streak: i64,
    #[serde(default = "default_hard_rate")]
    pub hard_rate: i64,
    #[serde(default = "default_hard_streak")]
    pub hard_streak: i64,
}

/// Sampling weights given to new habits by difficulty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HabitWeightsConfig {
    #[serde(default = "default_easy_weight")]
    pub easy: i64,
    #[serde(default = "default_normal_weight")]
    pub normal: i64,
    #[serde(default = "default_hard_weight")]
    pub hard: i64,
}

/// Point economy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointsConfig {
    /// Points charged per converted unit.
    #[serde(default = "default_conversion_rate")]
    pub conversion_rate: i64,
}

/// Leaderboard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardConfig {
    #[serde(default = "default_leaderboard_key")]
    pub key: String,
}

/// Per-user lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Use the cache-backed token lock instead of the in-process one.
    #[serde(default)]
    pub distributed: bool,
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_attempts")]
    pub attempts: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub backoff_ms: u64,
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/habitquest/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// UTC offset of the one timezone used for calendar days.
    #[serde(default = "default_timezone_offset_minutes")]
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub experience: ExperienceConfig,
    #[serde(default)]
    pub unlock: UnlockConfig,
    #[serde(default)]
    pub habit_weights: HabitWeightsConfig,
    #[serde(default)]
    pub points: PointsConfig,
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

// Default functions
fn default_timezone_offset_minutes() -> i32 {
    7 * 60
}
fn default_base_exp() -> f64 {
    100.0
}
fn default_exp_factor() -> f64 {
    1.5
}
fn default_easy_gain() -> i64 {
    10
}
fn default_normal_gain() -> i64 {
    25
}
fn default_hard_gain() -> i64 {
    50
}
fn default_normal_rate() -> i64 {
    50
}
fn default_normal_streak() -> i64 {
    3
}
fn default_hard_rate() -> i64 {
    70
}
fn default_hard_streak() -> i64 {
    5
}
fn default_easy_weight() -> i64 {
    70
}
fn default_normal_weight() -> i64 {
    25
}
fn default_hard_weight() -> i64 {
    5
}
fn default_conversion_rate() -> i64 {
    100
}
fn default_leaderboard_key() -> String {
    "habitquest:leaderboard".into()
}
fn default_lock_ttl_secs() -> u64 {
    10
}
fn default_lock_attempts() -> u32 {
    50
}
fn default_lock_backoff_ms() -> u64 {
    20
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            base_exp: default_base_exp(),
            exp_factor: default_exp_factor(),
            easy_gain: default_easy_gain(),
            normal_gain: default_normal_gain(),
            hard_gain: default_hard_gain(),
        }
    }
}

impl ExperienceConfig {
    /// Fixed exp gained for completing a task of this difficulty.
    pub fn gain_for(&self, difficulty: Difficulty) -> i64 {
        match difficulty {
            Difficulty::Easy => self.easy_gain,
            Difficulty::Normal => self.normal_gain,
            Difficulty::Hard => self.hard_gain,
        }
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            normal_rate: default_normal_rate(),
            normal_streak: default_normal_streak(),
            hard_rate: default_hard_rate(),
            hard_streak: default_hard_streak(),
        }
    }
}

impl Default for HabitWeightsConfig {
    fn default() -> Self {
        Self {
            easy: default_easy_weight(),
            normal: default_normal_weight(),
            hard: default_hard_weight(),
        }
    }
}

impl HabitWeightsConfig {
    pub fn weight_for(&self, difficulty: Difficulty) -> i64 {
        match difficulty {
            Difficulty::Easy => self.easy,
            Difficulty::Normal => self.normal,
            Difficulty::Hard => self.hard,
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            conversion_rate: default_conversion_rate(),
        }
    }
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            key: default_leaderboard_key(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            distributed: false,
            ttl_secs: default_lock_ttl_secs(),
            attempts: default_lock_attempts(),
            backoff_ms: default_lock_backoff_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone_offset_minutes: default_timezone_offset_minutes(),
            experience: ExperienceConfig::default(),
            unlock: UnlockConfig::default(),
            habit_weights: HabitWeightsConfig::default(),
            points: PointsConfig::default(),
            leaderboard: LeaderboardConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::InvalidValue {
            key: key.to_string(),
            message: "unknown config key".into(),
        };
        let unparsable = |kind: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{value}' as {kind}"),
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|_| unparsable("bool"))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<i64>() {
                            serde_json::Value::Number(n.into())
                        } else if let Ok(n) = value.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| unparsable("number"))?
                        } else {
                            return Err(unparsable("number"));
                        }
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the config file.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("config.toml"),
                message: e.to_string(),
            })
    }

    /// Load from `path`, writing and returning the defaults if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or fails
    /// validation, or if the default config cannot be written.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content)
                    .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Persist to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key and validate the result.
    /// The caller decides whether to persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the resulting config is invalid.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config =
            serde_json::from_value(json).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.into(),
                message: message.into(),
            })
        };

        DayClock::from_offset_minutes(self.timezone_offset_minutes)?;
        if !(self.experience.base_exp >= 1.0) {
            return invalid("experience.base_exp", "must be at least 1");
        }
        if !(self.experience.exp_factor > 0.0) {
            return invalid("experience.exp_factor", "must be positive");
        }
        for (key, gain) in [
            ("experience.easy_gain", self.experience.easy_gain),
            ("experience.normal_gain", self.experience.normal_gain),
            ("experience.hard_gain", self.experience.hard_gain),
        ] {
            if gain < 0 {
                return invalid(key, "must not be negative");
            }
        }
        for (key, weight) in [
            ("habit_weights.easy", self.habit_weights.easy),
            ("habit_weights.normal", self.habit_weights.normal),
            ("habit_weights.hard", self.habit_weights.hard),
        ] {
            if weight < 1 {
                return invalid(key, "must be at least 1");
            }
        }
        for (key, rate) in [
            ("unlock.normal_rate", self.unlock.normal_rate),
            ("unlock.hard_rate", self.unlock.hard_rate),
        ] {
            if !(0..=100).contains(&rate) {
                return invalid(key, "must be a percentage between 0 and 100");
            }
        }
        if self.points.conversion_rate < 1 {
            return invalid("points.conversion_rate", "must be at least 1");
        }
        if self.leaderboard.key.is_empty() {
            return invalid("leaderboard.key", "must not be empty");
        }
        if self.lock.attempts == 0 {
            return invalid("lock.attempts", "must be at least 1");
        }
        Ok(())
    }

    /// The calendar used for every day boundary.
    pub fn day_clock(&self) -> Result<DayClock, ConfigError> {
        DayClock::from_offset_minutes(self.timezone_offset_minutes)
    }
}

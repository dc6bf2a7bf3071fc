//! Point multiplier by level band and streak.
//!
//! Applies to point rewards from discrete events (quests, treasures,
//! events). Fixed per-difficulty task experience is never multiplied.

/// Base multiplier per level band. Levels outside the table use 1.0.
const LEVEL_BANDS: [(std::ops::RangeInclusive<i64>, f64); 5] = [
    (1..=3, 1.0),
    (4..=6, 1.2),
    (7..=9, 1.5),
    (10..=12, 1.8),
    (13..=15, 2.0),
];

/// Streak days per bonus step.
const STREAK_STEP: i64 = 5;
/// Bonus added per completed step.
const STREAK_BONUS: f64 = 0.1;

/// Base multiplier for a level.
pub fn level_multiplier(level: i64) -> f64 {
    LEVEL_BANDS
        .iter()
        .find(|(band, _)| band.contains(&level))
        .map(|(_, m)| *m)
        .unwrap_or(1.0)
}

/// Bonus earned by the current streak: 0.1 per full five days.
pub fn streak_bonus(streak: i64) -> f64 {
    (streak.max(0) / STREAK_STEP) as f64 * STREAK_BONUS
}

/// Total multiplier for a reward.
pub fn multiplier(level: i64, streak: i64) -> f64 {
    level_multiplier(level) + streak_bonus(streak)
}

/// Scale a base reward and round to whole points.
pub fn apply(base_points: i64, level: i64, streak: i64) -> i64 {
    (base_points as f64 * multiplier(level, streak)).round() as i64
}

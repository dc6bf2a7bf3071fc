//! Weighted sampling of habits without replacement.
//!
//! Each draw is a roulette-wheel pick over the cumulative weights of the
//! habits not chosen yet: prefix sums are built over the remaining pool and
//! a uniform draw in `1..=total` is located by binary search. A drawn habit
//! whose id was already chosen (duplicate ids in the pool) is discarded and
//! the draw is retried against the shrunken pool, so the loop always ends.

use std::collections::HashSet;

use rand::Rng;

use super::Habit;
use crate::error::ValidationError;

/// Reject pools containing a non-positive weight.
pub fn validate_weights(habits: &[Habit]) -> Result<(), ValidationError> {
    match habits.iter().find(|h| h.weight < 1) {
        Some(h) => Err(ValidationError::InvalidWeight {
            habit_id: h.id,
            weight: h.weight,
        }),
        None => Ok(()),
    }
}

/// Pick up to `n` distinct habits, favouring heavier weights.
///
/// Returns at most `min(n, habits.len())` habits, never the same id twice.
///
/// # Errors
/// Fails with [`ValidationError::InvalidWeight`] if any habit has weight < 1.
pub fn pick_n<R: Rng + ?Sized>(
    habits: &[Habit],
    n: usize,
    rng: &mut R,
) -> Result<Vec<Habit>, ValidationError> {
    validate_weights(habits)?;

    let target = n.min(habits.len());
    let mut remaining: Vec<&Habit> = habits.iter().collect();
    let mut seen: HashSet<i64> = HashSet::with_capacity(target);
    let mut chosen = Vec::with_capacity(target);
    let mut prefix: Vec<i64> = Vec::with_capacity(remaining.len());

    while chosen.len() < target && !remaining.is_empty() {
        prefix.clear();
        let mut total = 0i64;
        for habit in &remaining {
            total = total.saturating_add(habit.weight);
            prefix.push(total);
        }

        let ticket = rng.gen_range(1..=total);
        let idx = prefix
            .partition_point(|&cumulative| cumulative < ticket)
            .min(remaining.len() - 1);

        let drawn = remaining.swap_remove(idx);
        if seen.insert(drawn.id) {
            chosen.push(drawn.clone());
        }
    }

    Ok(chosen)
}

//! Experience and levelling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Profile, RequestContext, UserId};
use crate::error::{Result, RuleViolation, ValidationError};
use crate::notify::Notifier;
use crate::storage::{ExperienceConfig, ProgressDb};

/// Experience required to clear `level`.
///
/// `round(base_exp * max(level - 1, 1) ^ exp_factor)`, never below 1.
/// Level 1 and level 2 therefore share the same requirement.
pub fn exp_needed_for(level: i64, config: &ExperienceConfig) -> i64 {
    let steps = (level - 1).max(1) as f64;
    let needed = (config.base_exp * steps.powf(config.exp_factor)).round();
    if needed.is_finite() && needed < i64::MAX as f64 {
        (needed as i64).max(1)
    } else {
        i64::MAX
    }
}

/// Result of an experience gain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub profile: Profile,
    /// Every level reached by this gain, in order.
    pub levels_reached: Vec<i64>,
}

impl LevelProgress {
    pub fn leveled_up(&self) -> bool {
        !self.levels_reached.is_empty()
    }
}

pub struct ExperienceLedger {
    db: Arc<ProgressDb>,
    config: ExperienceConfig,
    notifier: Arc<dyn Notifier>,
}

impl ExperienceLedger {
    pub fn new(db: Arc<ProgressDb>, config: ExperienceConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            db,
            config,
            notifier,
        }
    }

    pub fn config(&self) -> &ExperienceConfig {
        &self.config
    }

    /// Add `gain` experience and clear as many levels as it covers.
    ///
    /// The gain is applied with one atomic update; each level is then cleared
    /// by a conditional update that only succeeds while the stored exp still
    /// covers the stored requirement. One level-up notification is sent per
    /// level crossed.
    ///
    /// # Errors
    /// Negative gains are rejected; a missing profile is
    /// [`RuleViolation::ProfileNotFound`].
    pub fn increase_exp(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        gain: i64,
    ) -> Result<LevelProgress> {
        if gain < 0 {
            return Err(ValidationError::NegativeAmount {
                field: "gain".into(),
                value: gain,
            }
            .into());
        }

        ctx.check("experience")?;
        let profile = if gain == 0 {
            self.db.profile(user_id)?
        } else {
            self.db.add_exp(user_id, gain)?
        }
        .ok_or(RuleViolation::ProfileNotFound { user_id })?;
        self.clear_levels(ctx, user_id, profile)
    }

    /// Clear every level the stored experience already covers.
    ///
    /// Used after a gain was committed elsewhere; running it again once
    /// nothing is left to clear changes nothing.
    pub fn settle(&self, ctx: &RequestContext, user_id: UserId) -> Result<LevelProgress> {
        ctx.check("experience")?;
        let profile = self
            .db
            .profile(user_id)?
            .ok_or(RuleViolation::ProfileNotFound { user_id })?;
        self.clear_levels(ctx, user_id, profile)
    }

    fn clear_levels(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        mut profile: Profile,
    ) -> Result<LevelProgress> {
        let mut levels_reached = Vec::new();
        while profile.current_exp >= profile.exp_needed {
            ctx.check("level up")?;
            let next_needed = exp_needed_for(profile.level + 1, &self.config);
            match self.db.apply_level_up(user_id, next_needed)? {
                Some(updated) => {
                    tracing::info!(user_id, level = updated.level, "level up");
                    levels_reached.push(updated.level);
                    self.notifier.level_up(user_id, updated.level)?;
                    profile = updated;
                }
                None => {
                    // Someone else cleared this level first; re-read and continue.
                    ctx.check("experience")?;
                    profile = self
                        .db
                        .profile(user_id)?
                        .ok_or(RuleViolation::ProfileNotFound { user_id })?;
                }
            }
        }

        Ok(LevelProgress {
            profile,
            levels_reached,
        })
    }
}

//! Spendable points: multiplied rewards in, guarded spends out.
//!
//! The durable balance and its history row commit together. The leaderboard
//! follows afterwards; if that cache write fails the durable write stands
//! and the caller gets [`InfraError::LeaderboardDesync`] so the score can be
//! reconciled later.

use std::sync::Arc;

use super::{multiplier, Leaderboard, Profile, RequestContext, UserId};
use crate::clock::Clock;
use crate::error::{CoreError, InfraError, Result, RuleViolation, ValidationError};
use crate::storage::{HistoryRecord, ProgressDb};

pub struct PointLedger {
    db: Arc<ProgressDb>,
    leaderboard: Arc<Leaderboard>,
    clock: Arc<dyn Clock>,
}

fn non_negative(field: &str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::NegativeAmount {
            field: field.into(),
            value,
        });
    }
    Ok(())
}

impl PointLedger {
    pub fn new(db: Arc<ProgressDb>, leaderboard: Arc<Leaderboard>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            leaderboard,
            clock,
        }
    }

    /// Credit `base_points` scaled by the level and streak multiplier, then
    /// add the credited amount to the leaderboard.
    ///
    /// Returns the updated profile.
    #[allow(clippy::too_many_arguments)]
    pub fn award(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        base_points: i64,
        source_name: &str,
        source_category: &str,
        level: i64,
        streak: i64,
    ) -> Result<Profile> {
        let (profile, real) = self.credit(
            ctx,
            user_id,
            base_points,
            source_name,
            source_category,
            level,
            streak,
        )?;
        self.sync_leaderboard(ctx, user_id, real)?;
        Ok(profile)
    }

    /// The durable half of [`PointLedger::award`]. The balance and its
    /// history row commit together; the leaderboard is left to
    /// [`PointLedger::sync_leaderboard`].
    ///
    /// Returns the updated profile and the amount credited.
    #[allow(clippy::too_many_arguments)]
    pub fn credit(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        base_points: i64,
        source_name: &str,
        source_category: &str,
        level: i64,
        streak: i64,
    ) -> Result<(Profile, i64)> {
        non_negative("base_points", base_points)?;
        let real = multiplier::apply(base_points, level, streak);

        ctx.check("point credit")?;
        let profile = self
            .db
            .credit_points(user_id, real, source_name, source_category, self.clock.now())?
            .ok_or(RuleViolation::ProfileNotFound { user_id })?;
        tracing::debug!(user_id, base_points, real, source = source_name, "points awarded");
        Ok((profile, real))
    }

    /// Add an already credited amount to the user's leaderboard score.
    ///
    /// # Errors
    /// A cache failure becomes [`InfraError::LeaderboardDesync`].
    pub fn sync_leaderboard(&self, ctx: &RequestContext, user_id: UserId, real: i64) -> Result<()> {
        match self.leaderboard.incr_score(ctx, user_id, real) {
            Ok(_) => Ok(()),
            Err(CoreError::Infrastructure(InfraError::Cache(source))) => {
                tracing::warn!(user_id, error = %source, "leaderboard left behind durable balance");
                Err(InfraError::LeaderboardDesync { user_id, source }.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Debit `amount` points without any multiplier.
    ///
    /// # Errors
    /// [`RuleViolation::InsufficientBalance`] when the balance is too low;
    /// nothing is written in that case.
    pub fn spend(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        amount: i64,
        reason: &str,
    ) -> Result<Profile> {
        non_negative("amount", amount)?;

        ctx.check("point debit")?;
        if let Some(profile) =
            self.db
                .debit_points(user_id, amount, reason, reason, self.clock.now())?
        {
            tracing::debug!(user_id, amount, reason, "points spent");
            return Ok(profile);
        }

        ctx.check("point balance")?;
        match self.db.profile(user_id)? {
            Some(profile) => Err(RuleViolation::InsufficientBalance {
                available: profile.points,
                requested: amount,
            }
            .into()),
            None => Err(RuleViolation::ProfileNotFound { user_id }.into()),
        }
    }

    pub fn history(&self, ctx: &RequestContext, user_id: UserId) -> Result<Vec<HistoryRecord>> {
        ctx.check("point history")?;
        Ok(self.db.history(user_id)?)
    }
}

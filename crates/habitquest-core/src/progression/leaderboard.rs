//! Global ranking over a cache sorted set.
//!
//! Scores live in one sorted set keyed by user id; display metadata sits in
//! a side hash per member (`name`, `avatar`). The durable store stays the
//! source of truth and reconciliation can rebuild both at any time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{RequestContext, UserId};
use crate::cache::CacheStore;
use crate::error::{Result, RuleViolation};

/// One row of the ranked listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    /// 1-indexed position
    pub rank: u64,
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub score: i64,
}

pub struct Leaderboard {
    cache: Arc<dyn CacheStore>,
    key: String,
}

fn member(user_id: UserId) -> String {
    user_id.to_string()
}

fn info_key(user_id: UserId) -> String {
    format!("user:leaderboard:{user_id}")
}

impl Leaderboard {
    pub fn new(cache: Arc<dyn CacheStore>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
        }
    }

    /// Set the score outright.
    pub fn upsert_score(&self, ctx: &RequestContext, user_id: UserId, score: i64) -> Result<()> {
        ctx.check("leaderboard upsert")?;
        self.cache.zadd(&self.key, &member(user_id), score as f64)?;
        Ok(())
    }

    /// Add `delta` to the score, creating the entry if needed. Returns the new score.
    pub fn incr_score(&self, ctx: &RequestContext, user_id: UserId, delta: i64) -> Result<i64> {
        ctx.check("leaderboard increment")?;
        let score = self.cache.zincrby(&self.key, &member(user_id), delta as f64)?;
        Ok(score.round() as i64)
    }

    pub fn score(&self, ctx: &RequestContext, user_id: UserId) -> Result<Option<i64>> {
        ctx.check("leaderboard score")?;
        let score = self.cache.zscore(&self.key, &member(user_id))?;
        Ok(score.map(|s| s.round() as i64))
    }

    /// 1-indexed position by descending score.
    ///
    /// # Errors
    /// [`RuleViolation::NotRanked`] when the user has no score.
    pub fn rank(&self, ctx: &RequestContext, user_id: UserId) -> Result<u64> {
        ctx.check("leaderboard rank")?;
        match self.cache.zrevrank(&self.key, &member(user_id))? {
            Some(position) => Ok(position + 1),
            None => Err(RuleViolation::NotRanked { user_id }.into()),
        }
    }

    /// The `limit` highest scores joined with their display metadata.
    pub fn top_n(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<LeaderboardRow>> {
        ctx.check("leaderboard range")?;
        let entries = self.cache.zrevrange_with_scores(&self.key, 0, limit)?;

        let mut rows = Vec::with_capacity(entries.len());
        for (position, (raw_member, score)) in entries.into_iter().enumerate() {
            let Ok(user_id) = raw_member.parse::<UserId>() else {
                tracing::warn!(member = %raw_member, "skipping non-numeric leaderboard member");
                continue;
            };
            ctx.check("leaderboard metadata")?;
            let mut info = self.cache.hgetall(&info_key(user_id))?;
            rows.push(LeaderboardRow {
                rank: position as u64 + 1,
                user_id,
                name: info.remove("name").unwrap_or_default(),
                avatar_url: info.remove("avatar").unwrap_or_default(),
                score: score.round() as i64,
            });
        }
        Ok(rows)
    }

    /// Re-sync the display metadata shown next to a member.
    pub fn set_member_info(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        name: &str,
        avatar_url: &str,
    ) -> Result<()> {
        ctx.check("leaderboard metadata")?;
        self.cache
            .hset(&info_key(user_id), &[("name", name), ("avatar", avatar_url)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use proptest::prelude::*;

    fn board() -> Leaderboard {
        Leaderboard::new(Arc::new(MemoryCache::new()), "test:board")
    }

    #[test]
    fn rank_is_one_indexed_and_descending() {
        let board = board();
        let ctx = RequestContext::background();
        board.upsert_score(&ctx, 1, 10).unwrap();
        board.upsert_score(&ctx, 2, 30).unwrap();
        board.incr_score(&ctx, 3, 20).unwrap();
        assert_eq!(board.rank(&ctx, 2).unwrap(), 1);
        assert_eq!(board.rank(&ctx, 3).unwrap(), 2);
        assert_eq!(board.rank(&ctx, 1).unwrap(), 3);
        assert_eq!(board.incr_score(&ctx, 1, 25).unwrap(), 35);
        assert_eq!(board.rank(&ctx, 1).unwrap(), 1);
    }

    #[test]
    fn missing_member_is_not_ranked() {
        let board = board();
        let err = board.rank(&RequestContext::background(), 42).unwrap_err();
        assert_eq!(err.rule(), Some(&RuleViolation::NotRanked { user_id: 42 }));
        assert_eq!(board.score(&RequestContext::background(), 42).unwrap(), None);
    }

    #[test]
    fn top_n_joins_metadata() {
        let board = board();
        let ctx = RequestContext::background();
        board.upsert_score(&ctx, 1, 5).unwrap();
        board.upsert_score(&ctx, 2, 9).unwrap();
        board.upsert_score(&ctx, 3, 1).unwrap();
        board.set_member_info(&ctx, 2, "Bima", "b.png").unwrap();

        let top = board.top_n(&ctx, 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(
            top[0],
            LeaderboardRow {
                rank: 1,
                user_id: 2,
                name: "Bima".into(),
                avatar_url: "b.png".into(),
                score: 9,
            }
        );
        assert_eq!(top[1].user_id, 1);
        assert!(top[1].name.is_empty());
    }

    proptest! {
        #[test]
        fn higher_score_never_ranks_below_lower(scores in proptest::collection::vec(0i64..1_000, 1..25)) {
            let board = board();
            let ctx = RequestContext::background();
            for (i, score) in scores.iter().enumerate() {
                board.upsert_score(&ctx, i as UserId, *score).unwrap();
            }
            for (a, sa) in scores.iter().enumerate() {
                for (b, sb) in scores.iter().enumerate() {
                    if sa > sb {
                        let ra = board.rank(&ctx, a as UserId).unwrap();
                        let rb = board.rank(&ctx, b as UserId).unwrap();
                        prop_assert!(ra < rb);
                    }
                }
            }
        }
    }
}

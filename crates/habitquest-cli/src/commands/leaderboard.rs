use clap::Subcommand;
use serde_json::json;

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum LeaderboardAction {
    /// Highest scores
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// A user's position
    Rank {
        user: i64,
    },
}

pub fn run(action: LeaderboardAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();
    let board = engine.leaderboard();

    match action {
        LeaderboardAction::Top { limit } => {
            print_json(&board.top_n(&ctx, limit)?)?;
        }
        LeaderboardAction::Rank { user } => {
            let rank = board.rank(&ctx, user)?;
            let score = board.score(&ctx, user)?;
            print_json(&json!({ "user_id": user, "rank": rank, "score": score }))?;
        }
    }
    Ok(())
}

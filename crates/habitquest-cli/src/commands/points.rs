use clap::Subcommand;
use habitquest_core::RewardSource;

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum PointsAction {
    /// Claim a reward; the multiplier applies
    Claim {
        user: i64,
        /// Reward name
        #[arg(long)]
        name: String,
        /// Reward category (quest, treasure, challenge, event)
        #[arg(long, default_value = "quest")]
        category: String,
        /// Points before the multiplier
        #[arg(long)]
        base: i64,
    },
    /// Convert points at the configured rate
    Convert {
        user: i64,
        /// Units to convert
        amount: i64,
    },
    /// Point history
    History {
        user: i64,
    },
}

pub fn run(action: PointsAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();

    match action {
        PointsAction::Claim {
            user,
            name,
            category,
            base,
        } => {
            let source = RewardSource {
                name,
                category,
                base_points: base,
            };
            print_json(&engine.claim_reward(&ctx, user, &source)?)?;
        }
        PointsAction::Convert { user, amount } => {
            print_json(&engine.convert_points(&ctx, user, amount)?)?;
        }
        PointsAction::History { user } => {
            print_json(&engine.points().history(&ctx, user)?)?;
        }
    }
    Ok(())
}

use clap::Subcommand;
use serde_json::json;

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum StreakAction {
    /// Count today
    CheckIn {
        user: i64,
    },
    /// Current streak and check-in state
    Show {
        user: i64,
    },
}

pub fn run(action: StreakAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();
    let streaks = engine.streaks();

    match action {
        StreakAction::CheckIn { user } => {
            print_json(&streaks.check_in(&ctx, user, engine.now())?)?;
        }
        StreakAction::Show { user } => {
            let streak = streaks.current_streak(&ctx, user)?;
            let state = streaks.state(&ctx, user, engine.now())?;
            print_json(&json!({ "streak": streak, "state": state }))?;
        }
    }
    Ok(())
}

use clap::Subcommand;

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum UserAction {
    /// Create a profile and its leaderboard entry
    Register {
        /// User id
        user: i64,
        /// Display name
        name: String,
        /// Avatar URL
        #[arg(long, default_value = "")]
        avatar: String,
    },
    /// Show a profile
    Show {
        user: i64,
    },
    /// Change display name and avatar
    Update {
        user: i64,
        name: String,
        #[arg(long, default_value = "")]
        avatar: String,
    },
    /// Show the user's journal
    Journal {
        user: i64,
    },
}

pub fn run(action: UserAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();

    match action {
        UserAction::Register { user, name, avatar } => {
            let profile = engine.register_user(&ctx, user, &name, &avatar)?;
            print_json(&profile)?;
        }
        UserAction::Show { user } => {
            print_json(&engine.profile(&ctx, user)?)?;
        }
        UserAction::Update { user, name, avatar } => {
            let profile = engine.update_display(&ctx, user, &name, &avatar)?;
            print_json(&profile)?;
        }
        UserAction::Journal { user } => {
            print_json(&engine.db().journal(user)?)?;
        }
    }
    Ok(())
}

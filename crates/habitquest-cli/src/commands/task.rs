use clap::Subcommand;

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum TaskAction {
    /// Assign today's tasks from the active packet
    Assign {
        user: i64,
    },
    /// Show today's tasks without assigning
    Today {
        user: i64,
    },
    /// Complete a task
    Complete {
        user: i64,
        /// Task id
        task: i64,
    },
}

pub fn run(action: TaskAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();

    match action {
        TaskAction::Assign { user } => {
            print_json(&engine.assign_daily_tasks(&ctx, user)?)?;
        }
        TaskAction::Today { user } => {
            print_json(&engine.tasks_today(&ctx, user)?)?;
        }
        TaskAction::Complete { user, task } => {
            print_json(&engine.complete_task(&ctx, user, task)?)?;
        }
    }
    Ok(())
}

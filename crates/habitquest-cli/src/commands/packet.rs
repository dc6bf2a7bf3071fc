use clap::Subcommand;
use habitquest_core::{Difficulty, NewHabit, NewPacket};

use super::{open_engine, print_json, request};

#[derive(Subcommand)]
pub enum PacketAction {
    /// Create a packet with its habits
    Create {
        user: i64,
        /// Packet name
        #[arg(long)]
        name: String,
        /// Tasks to complete before the packet is done
        #[arg(long)]
        expected: i64,
        /// Tasks assigned per day
        #[arg(long, default_value_t = 3)]
        per_day: i64,
        /// Habit as "difficulty:name" (e.g. "easy:Bring a bottle"); repeatable
        #[arg(long = "habit", required = true)]
        habits: Vec<String>,
    },
    /// List the user's packets
    List {
        user: i64,
    },
    /// List a packet's habits
    Habits {
        packet: i64,
    },
}

fn parse_habit(arg: &str) -> Result<NewHabit, Box<dyn std::error::Error>> {
    let (difficulty, name) = arg
        .split_once(':')
        .ok_or_else(|| format!("habit '{arg}' must look like difficulty:name"))?;
    Ok(NewHabit {
        name: name.trim().to_string(),
        description: String::new(),
        difficulty: difficulty.trim().parse::<Difficulty>()?,
    })
}

pub fn run(action: PacketAction) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let ctx = request();

    match action {
        PacketAction::Create {
            user,
            name,
            expected,
            per_day,
            habits,
        } => {
            let habits = habits
                .iter()
                .map(|arg| parse_habit(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let created = engine.create_packet(
                &ctx,
                user,
                &NewPacket {
                    name,
                    expected_task: expected,
                    task_per_day: per_day,
                    habits,
                },
            )?;
            print_json(&created)?;
        }
        PacketAction::List { user } => {
            print_json(&engine.db().packets(user)?)?;
        }
        PacketAction::Habits { packet } => {
            print_json(&engine.db().habits(packet)?)?;
        }
    }
    Ok(())
}

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "habitquest-cli", version, about = "HabitQuest progression CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Profiles and journal
    User {
        #[command(subcommand)]
        action: commands::user::UserAction,
    },
    /// Packet management
    Packet {
        #[command(subcommand)]
        action: commands::packet::PacketAction,
    },
    /// Daily tasks
    Task {
        #[command(subcommand)]
        action: commands::task::TaskAction,
    },
    /// Daily check-in streaks
    Streak {
        #[command(subcommand)]
        action: commands::streak::StreakAction,
    },
    /// Rewards, conversions and point history
    Points {
        #[command(subcommand)]
        action: commands::points::PointsAction,
    },
    /// Global ranking
    Leaderboard {
        #[command(subcommand)]
        action: commands::leaderboard::LeaderboardAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Rebuild leaderboard scores from durable point history
    Reconcile,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("HABITQUEST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::User { action } => commands::user::run(action),
        Commands::Packet { action } => commands::packet::run(action),
        Commands::Task { action } => commands::task::run(action),
        Commands::Streak { action } => commands::streak::run(action),
        Commands::Points { action } => commands::points::run(action),
        Commands::Leaderboard { action } => commands::leaderboard::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Reconcile => commands::reconcile::run(),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

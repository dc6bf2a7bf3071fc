pub mod config;
pub mod leaderboard;
pub mod packet;
pub mod points;
pub mod reconcile;
pub mod streak;
pub mod task;
pub mod user;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use habitquest_core::cache::{CacheStore, SqliteCache};
use habitquest_core::storage::data_dir;
use habitquest_core::{Config, ProgressDb, ProgressionEngine, RequestContext};
use serde::Serialize;

/// Deadline applied to every command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Open both stores in the data directory and build the engine.
pub fn open_engine() -> Result<ProgressionEngine, Box<dyn Error>> {
    let config = Config::load()?;
    let dir = data_dir()?;
    tracing::debug!(dir = %dir.display(), "opening stores");
    let db = Arc::new(ProgressDb::open_at(&dir.join("habitquest.db"))?);
    let cache: Arc<dyn CacheStore> = Arc::new(SqliteCache::open_at(&dir.join("cache.db"))?);
    Ok(ProgressionEngine::builder(db, cache, config).build()?)
}

pub fn request() -> RequestContext {
    RequestContext::with_timeout(COMMAND_TIMEOUT)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

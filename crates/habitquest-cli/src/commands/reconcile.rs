use serde_json::json;

use super::{open_engine, print_json, request};

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine()?;
    let users = engine.reconcile_leaderboard(&request())?;
    print_json(&json!({ "reconciled": users }))
}

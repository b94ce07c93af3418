//! CLI command implementations.

pub mod jobs;

use anyhow::{Context, Result};
use jobq_config::{SystemConfig, parse_system_config};
use jobq_db::{create_pool, run_migrations};
use serde_json::Value;
use std::path::Path;
use tracing::info;

pub async fn migrate(config: &SystemConfig) -> Result<()> {
    let pool = create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;
    info!("Migrations applied");
    println!("Database is up to date");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    match parse_system_config(&content) {
        Ok(_config) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Interpret a command-line argument as a JSON primitive, falling back to a
/// plain string.
pub fn parse_arg(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if !value.is_array() && !value.is_object() => value,
        _ => Value::String(raw.to_string()),
    }
}

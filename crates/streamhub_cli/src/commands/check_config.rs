//! Check-config command implementation.

use std::path::Path;
use streamhub_core::{HubConfig, HubResult};

/// Loads and validates a configuration file.
pub fn load(path: &Path) -> HubResult<HubConfig> {
    let config = HubConfig::from_file(path)?;
    tracing::debug!(
        collections = config.watched_collections.len(),
        max_attempts = config.reconnect.max_attempts,
        "configuration loaded"
    );
    Ok(config)
}

/// Runs the check-config command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

//! Subcommand implementations.

use std::path::Path;

use anyhow::{Context, Result};
use guarddog_core::GuardDogConfig;

pub mod check_config;
pub mod replay;
pub mod similarity;
pub mod trust;

/// Reads `path`, or returns defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> Result<GuardDogConfig> {
    let Some(path) = path else {
        tracing::debug!("no configuration file given, using defaults");
        return Ok(GuardDogConfig::default());
    };
    GuardDogConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

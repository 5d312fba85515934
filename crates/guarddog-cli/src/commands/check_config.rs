//! `guarddog check-config`

use anyhow::{Context, Result};
use guarddog_core::{ContentFilter, GuardDogConfig};

/// Prints the effective configuration as TOML.
pub fn run(config: &GuardDogConfig) -> Result<()> {
    let rendered = config.to_toml().context("failed to render configuration")?;
    println!("{rendered}");

    let filter = match config.guarddog.content_filter {
        ContentFilter::Similarity => "similarity",
        ContentFilter::Risk => "risk",
    };
    eprintln!("configuration ok (content filter: {filter})");
    Ok(())
}

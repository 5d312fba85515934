//! `guarddog trust` subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use guarddog_core::{Clock, GuardDogConfig, SystemClock, TrustStore};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct TrustEntry {
    address: String,
    verified_at_ms: u64,
    expires_in_secs: u64,
}

fn open(config: &GuardDogConfig) -> Result<TrustStore> {
    let Some(path) = config.guarddog.captcha.trust_file() else {
        bail!("captcha.persist is disabled; trust records are kept in memory only");
    };
    open_at(path, config)
}

fn open_at(path: &Path, config: &GuardDogConfig) -> Result<TrustStore> {
    TrustStore::open(
        path,
        config.guarddog.captcha.verification_duration(),
        Arc::new(SystemClock),
    )
    .with_context(|| format!("failed to open trust file {}", path.display()))
}

/// Prints one JSON object per unexpired record.
pub fn list(config: &GuardDogConfig) -> Result<()> {
    let store = open(config)?;
    let now = SystemClock.now_ms();
    let duration_ms = u64::try_from(store.verification_duration().as_millis()).unwrap_or(u64::MAX);

    for (address, verified_at_ms) in store.snapshot() {
        let expires_at = verified_at_ms.saturating_add(duration_ms);
        let entry = TrustEntry {
            address: address.to_string(),
            verified_at_ms,
            expires_in_secs: expires_at.saturating_sub(now) / 1_000,
        };
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

/// Removes every record and waits for the file to be rewritten.
pub fn clear(config: &GuardDogConfig) -> Result<()> {
    let store = open(config)?;
    let count = store.len();
    store.clear();
    store.save().context("failed to rewrite trust file")?;
    eprintln!("removed {count} trust record(s)");
    Ok(())
}

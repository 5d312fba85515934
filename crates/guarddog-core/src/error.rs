//! Engine construction errors.

use thiserror::Error;

use crate::challenge::TrustStoreError;
use crate::config::ConfigError;

/// Errors building or reloading a [`crate::GuardDog`].
#[derive(Debug, Error)]
pub enum GuardDogError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trust file could not be loaded.
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
}

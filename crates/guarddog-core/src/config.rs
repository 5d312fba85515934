//! Engine configuration.
//!
//! One TOML document configures every gate. All keys are optional; missing
//! keys take the defaults shown below.
//!
//! ```toml
//! [guarddog]
//! enabled = true
//! content_filter = "similarity"   # or "risk"
//!
//! [guarddog.captcha]
//! duration_hours = 24
//! max_attempts = 3
//!
//! [guarddog.ratelimit]
//! max_burst = 3
//! refill_seconds = 2
//!
//! [guarddog.similarity]
//! threshold = 0.85
//!
//! [guarddog.heuristics]
//! min_move_distance = 2.0
//! min_account_age_seconds = 5
//!
//! [antispam]
//! self_similarity_threshold = 0.80
//! global_similarity_threshold = 0.85
//!
//! [antispam.penalties]
//! no_movement = 30
//!
//! [antispam.signals]
//! caps = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::behavior::BehaviorConfig;
use crate::challenge::ChallengeConfig;
use crate::rate_limit::RateLimitConfig;
use crate::risk::RiskConfig;
use crate::similarity_filter::SimilarityConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Which content filter runs last in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFilter {
    /// Lightweight repeat detection over accepted messages.
    #[default]
    Similarity,
    /// Composite decaying risk score over every message.
    Risk,
}

/// Module-level settings (`[guarddog]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Master switch. When off, every message is allowed.
    pub enabled: bool,
    /// Final pipeline stage.
    pub content_filter: ContentFilter,
    /// Verification challenge.
    pub captcha: ChallengeConfig,
    /// Token bucket.
    pub ratelimit: RateLimitConfig,
    /// Lightweight similarity filter.
    pub similarity: SimilarityConfig,
    /// Join-age and movement gate.
    pub heuristics: BehaviorConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            content_filter: ContentFilter::default(),
            captcha: ChallengeConfig::default(),
            ratelimit: RateLimitConfig::default(),
            similarity: SimilarityConfig::default(),
            heuristics: BehaviorConfig::default(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuardDogConfig {
    /// Pipeline and gate settings.
    #[serde(default)]
    pub guarddog: GuardConfig,

    /// Risk scorer settings.
    #[serde(default)]
    pub antispam: RiskConfig,
}

impl GuardDogConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let guard = &self.guarddog;
        let risk = &self.antispam;

        unit_interval("guarddog.similarity.threshold", guard.similarity.threshold)?;
        unit_interval("antispam.self_similarity_threshold", risk.self_similarity_threshold)?;
        unit_interval("antispam.global_similarity_threshold", risk.global_similarity_threshold)?;
        unit_interval("antispam.decay_factor", risk.decay_factor)?;

        non_zero("guarddog.similarity.history_size", guard.similarity.history_size)?;
        non_zero("guarddog.similarity.global_history_size", guard.similarity.global_history_size)?;
        non_zero("antispam.history_size", risk.history_size)?;
        non_zero("antispam.global_history_size", risk.global_history_size)?;

        if guard.ratelimit.max_burst == 0 {
            return Err(invalid("guarddog.ratelimit.max_burst must be at least 1"));
        }
        if guard.ratelimit.refill_seconds == 0 {
            return Err(invalid("guarddog.ratelimit.refill_seconds must be at least 1"));
        }
        if guard.captcha.max_attempts == 0 {
            return Err(invalid("guarddog.captcha.max_attempts must be at least 1"));
        }
        if guard.captcha.option_count < 2 {
            return Err(invalid("guarddog.captcha.option_count must be at least 2"));
        }
        if guard.captcha.duration_hours == 0 {
            return Err(invalid("guarddog.captcha.duration_hours must be at least 1"));
        }
        if guard.captcha.persist && guard.captcha.store_path.as_os_str().is_empty() {
            return Err(invalid("guarddog.captcha.store_path must be set when persist is enabled"));
        }

        non_negative("guarddog.heuristics.min_move_distance", guard.heuristics.min_move_distance)?;
        non_negative("guarddog.heuristics.movement_epsilon", guard.heuristics.movement_epsilon)?;
        non_negative("antispam.min_movement_distance", risk.min_movement_distance)?;

        // Movement tracking stops once the behavior gate is satisfied.
        if risk.require_movement && risk.signals.movement && risk.min_movement_distance > guard.heuristics.min_move_distance
        {
            return Err(invalid(format!(
                "antispam.min_movement_distance ({}) must not exceed guarddog.heuristics.min_move_distance ({})",
                risk.min_movement_distance, guard.heuristics.min_move_distance
            )));
        }

        if !(risk.warn_threshold <= risk.soft_block_threshold && risk.soft_block_threshold <= risk.block_threshold) {
            return Err(invalid(
                "antispam thresholds must satisfy warn_threshold <= soft_block_threshold <= block_threshold",
            ));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn unit_interval(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{key} must be within [0, 1], got {value}")))
    }
}

fn non_negative(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{key} must be a non-negative number, got {value}")))
    }
}

fn non_zero(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(invalid(format!("{key} must be at least 1")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GuardDogConfig::from_toml("").unwrap();

        assert_eq!(config, GuardDogConfig::default());
        assert!(config.guarddog.enabled);
        assert_eq!(config.guarddog.content_filter, ContentFilter::Similarity);
        assert_eq!(config.guarddog.ratelimit.max_burst, 3);
        assert_eq!(config.guarddog.captcha.max_attempts, 3);
        assert!((config.antispam.self_similarity_threshold - 0.80).abs() < f64::EPSILON);
        assert_eq!(config.antispam.penalties.no_movement, 30);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml = r#"
            [guarddog]
            content_filter = "risk"

            [guarddog.captcha]
            duration_hours = 12
            store_path = "/var/lib/guarddog/verified.json"

            [guarddog.ratelimit]
            max_burst = 5

            [antispam.penalties]
            no_movement = 10

            [antispam.signals]
            caps = false
        "#;

        let config = GuardDogConfig::from_toml(toml).unwrap();

        assert_eq!(config.guarddog.content_filter, ContentFilter::Risk);
        assert_eq!(config.guarddog.captcha.duration_hours, 12);
        assert_eq!(config.guarddog.captcha.max_attempts, 3);
        assert_eq!(
            config.guarddog.captcha.trust_file(),
            Some(Path::new("/var/lib/guarddog/verified.json"))
        );
        assert_eq!(config.guarddog.ratelimit.max_burst, 5);
        assert_eq!(config.guarddog.ratelimit.refill_seconds, 2);
        assert_eq!(config.antispam.penalties.no_movement, 10);
        assert_eq!(config.antispam.penalties.low_playtime, 25);
        assert!(!config.antispam.signals.caps);
        assert!(config.antispam.signals.invisible);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = GuardDogConfig::default();
        config.guarddog.heuristics.min_account_age_seconds = 30;
        config.antispam.signals.velocity = false;

        let parsed = GuardDogConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let err = GuardDogConfig::from_toml("[guarddog.similarity]\nthreshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("guarddog.similarity.threshold")));
    }

    #[test]
    fn test_trust_persisted_by_default() {
        let config = GuardDogConfig::default();
        assert_eq!(config.guarddog.captcha.trust_file(), Some(Path::new("guarddog_verified.json")));

        let memory_only = GuardDogConfig::from_toml("[guarddog.captcha]\npersist = false\n").unwrap();
        assert_eq!(memory_only.guarddog.captcha.trust_file(), None);
    }

    #[test]
    fn test_rejects_empty_store_path() {
        let err = GuardDogConfig::from_toml("[guarddog.captcha]\nstore_path = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("store_path")));
    }

    #[test]
    fn test_rejects_unreachable_movement_requirement() {
        let toml = "[guarddog.heuristics]\nmin_move_distance = 2.0\n\n[antispam]\nmin_movement_distance = 5.0\n";
        let err = GuardDogConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("antispam.min_movement_distance")));

        let toml = "[guarddog.heuristics]\nmin_move_distance = 5.0\n\n[antispam]\nmin_movement_distance = 5.0\n";
        assert!(GuardDogConfig::from_toml(toml).is_ok());

        let toml = "[antispam]\nmin_movement_distance = 5.0\nrequire_movement = false\n";
        assert!(GuardDogConfig::from_toml(toml).is_ok());
    }

    #[test]
    fn test_rejects_zero_refill() {
        let err = GuardDogConfig::from_toml("[guarddog.ratelimit]\nrefill_seconds = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_unordered_risk_thresholds() {
        let err = GuardDogConfig::from_toml("[antispam]\nwarn_threshold = 90\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("warn_threshold")));
    }

    #[test]
    fn test_rejects_unknown_content_filter() {
        let err = GuardDogConfig::from_toml("[guarddog]\ncontent_filter = \"magic\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[guarddog]\nenabled = false").unwrap();

        let config = GuardDogConfig::from_file(file.path()).unwrap();
        assert!(!config.guarddog.enabled);
    }

    #[test]
    fn test_missing_file() {
        let err = GuardDogConfig::from_file(Path::new("/nonexistent/guarddog.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

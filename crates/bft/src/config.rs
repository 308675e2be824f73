//! BFT configuration.

use pbft_types::{ProposerPolicy, ValidatorId, ValidatorSet, ValidatorSetError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid validator set: {0}")]
    ValidatorSet(#[from] ValidatorSetError),

    #[error("max_backoff_exponent {0} exceeds {MAX_BACKOFF_EXPONENT}")]
    BackoffExponent(u32),
}

/// Largest accepted `max_backoff_exponent`; `2^31` still fits a `u32` multiplier.
pub const MAX_BACKOFF_EXPONENT: u32 = 31;

/// BFT consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Base view-change timeout in milliseconds.
    pub view_change_timeout_ms: u64,

    /// Cap on the backoff doubling (timeout never exceeds base * 2^cap).
    pub max_backoff_exponent: u32,

    /// Build a checkpoint every this many sequences. 0 disables checkpoints.
    pub checkpoint_interval: u64,

    /// Maximum queued future messages per sender.
    pub backlog_capacity_per_sender: usize,

    /// Maximum client requests waiting to be proposed.
    pub max_pending_requests: usize,

    /// Proposer selection rule.
    pub proposer_policy: ProposerPolicy,

    /// Override for the tolerated fault count. `None` uses ceil(N/3) - 1.
    pub max_faulty: Option<usize>,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            view_change_timeout_ms: 3_000,
            max_backoff_exponent: 6,
            checkpoint_interval: 100,
            backlog_capacity_per_sender: 1024,
            max_pending_requests: 1024,
            proposer_policy: ProposerPolicy::RoundRobin,
            max_faulty: None,
        }
    }
}

impl BftConfig {
    /// Create a new BFT configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML. Missing fields keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_backoff_exponent > MAX_BACKOFF_EXPONENT {
            return Err(ConfigError::BackoffExponent(self.max_backoff_exponent));
        }
        Ok(())
    }

    /// Base view-change timeout.
    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }

    /// Set the view change timeout.
    pub fn with_view_change_timeout(mut self, timeout: Duration) -> Self {
        self.view_change_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the per-sender backlog capacity.
    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity_per_sender = capacity;
        self
    }

    /// Set the proposer selection rule.
    pub fn with_proposer_policy(mut self, policy: ProposerPolicy) -> Self {
        self.proposer_policy = policy;
        self
    }

    /// Override the tolerated fault count.
    pub fn with_max_faulty(mut self, faulty: usize) -> Self {
        self.max_faulty = Some(faulty);
        self
    }

    /// Build the validator set this configuration describes.
    pub fn validator_set(&self, validators: Vec<ValidatorId>) -> Result<ValidatorSet, ConfigError> {
        let set = ValidatorSet::new(validators, self.proposer_policy)?;
        Ok(match self.max_faulty {
            Some(faulty) => set.with_max_faulty(faulty)?,
            None => set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BftConfig::default();
        assert_eq!(config.view_change_timeout(), Duration::from_secs(3));
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.max_faulty, None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BftConfig::from_toml_str(
            r#"
            checkpoint_interval = 10
            proposer_policy = "rotating"
            "#,
        )
        .unwrap();
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.proposer_policy, ProposerPolicy::Rotating);
        assert_eq!(config.backlog_capacity_per_sender, 1024);
    }

    #[test]
    fn test_bad_toml_is_rejected() {
        assert!(matches!(
            BftConfig::from_toml_str("checkpoint_interval = \"often\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_backoff_exponent_is_bounded() {
        assert!(matches!(
            BftConfig::from_toml_str("max_backoff_exponent = 40"),
            Err(ConfigError::BackoffExponent(40))
        ));
        let config = BftConfig::from_toml_str("max_backoff_exponent = 31").unwrap();
        assert_eq!(config.max_backoff_exponent, MAX_BACKOFF_EXPONENT);
    }

    #[test]
    fn test_validator_set_applies_overrides() {
        let ids: Vec<_> = (0..7).map(ValidatorId).collect();
        let set = BftConfig::new()
            .with_max_faulty(1)
            .validator_set(ids.clone())
            .unwrap();
        assert_eq!(set.quorum(), 3);

        let err = BftConfig::new().with_max_faulty(3).validator_set(ids);
        assert!(matches!(err, Err(ConfigError::ValidatorSet(_))));
    }
}

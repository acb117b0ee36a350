//! `EdiscoveryConfig` (§6 "Configuration"): a single typed, validated
//! struct covering every row of the configuration table, loaded from TOML
//! or constructed programmatically. Matches the teacher workspace's
//! preference for typed config over raw maps.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EdiscoveryError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffortSetting {
    Low,
    Medium,
    High,
    Dynamic,
}

impl From<ReasoningEffortSetting> for ediscovery_privilege::ReasoningEffort {
    fn from(value: ReasoningEffortSetting) -> Self {
        match value {
            ReasoningEffortSetting::Low => ediscovery_privilege::ReasoningEffort::Low,
            ReasoningEffortSetting::Medium => ediscovery_privilege::ReasoningEffort::Medium,
            ReasoningEffortSetting::High => ediscovery_privilege::ReasoningEffort::High,
            ReasoningEffortSetting::Dynamic => ediscovery_privilege::ReasoningEffort::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeSettings {
    pub threshold_high: f64,
    pub threshold_low: f64,
    pub reasoning_effort: ReasoningEffortSetting,
    pub log_full_cot: bool,
}

impl Default for PrivilegeSettings {
    fn default() -> Self {
        Self {
            threshold_high: 0.85,
            threshold_low: 0.50,
            reasoning_effort: ReasoningEffortSetting::Dynamic,
            log_full_cot: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_sec: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_sec: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    pub rrf_k: f64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { rrf_k: 60.0 }
    }
}

/// Covers every row of spec.md §6's configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdiscoveryConfig {
    pub data_root: PathBuf,
    pub workers: usize,
    pub batch_size: usize,
    pub online_mode: bool,
    pub privilege: PrivilegeSettings,
    pub breaker: BreakerSettings,
    pub search: SearchSettings,
}

impl EdiscoveryConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            workers: default_workers(),
            batch_size: 1000,
            online_mode: false,
            privilege: PrivilegeSettings::default(),
            breaker: BreakerSettings::default(),
            search: SearchSettings::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, EdiscoveryError> {
        let config: Self = toml::from_str(text).map_err(|e| EdiscoveryError::Usage(format!("invalid TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, EdiscoveryError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EdiscoveryError::Usage(format!("cannot read config file {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&text)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_root.join("index")
    }

    pub fn metadata_cache_path(&self) -> PathBuf {
        self.data_root.join("index").join("metadata_cache.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_root.join("audit.jsonl")
    }

    /// `UsageError` on invalid values (§7); refuses to start rather than
    /// silently clamping.
    pub fn validate(&self) -> Result<(), EdiscoveryError> {
        if self.workers == 0 {
            return Err(EdiscoveryError::Usage("workers must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(EdiscoveryError::Usage("batch_size must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.privilege.threshold_high) {
            return Err(EdiscoveryError::Usage("privilege.threshold_high must be in [0,1]".to_string()));
        }
        if !(0.0..=1.0).contains(&self.privilege.threshold_low) {
            return Err(EdiscoveryError::Usage("privilege.threshold_low must be in [0,1]".to_string()));
        }
        if self.privilege.threshold_low > self.privilege.threshold_high {
            return Err(EdiscoveryError::Usage("privilege.threshold_low must be <= threshold_high".to_string()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(EdiscoveryError::Usage("breaker.failure_threshold must be >= 1".to_string()));
        }
        if self.search.rrf_k <= 0.0 {
            return Err(EdiscoveryError::Usage("search.rrf_k must be > 0".to_string()));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = EdiscoveryConfig::new("/tmp/ediscovery-data");
        assert_eq!(config.batch_size, 1000);
        assert!(!config.online_mode);
        assert_eq!(config.privilege.threshold_high, 0.85);
        assert_eq!(config.privilege.threshold_low, 0.50);
        assert!(!config.privilege.log_full_cot);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_sec, 60);
        assert_eq!(config.search.rrf_k, 60.0);
        assert!(config.workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn zero_workers_is_a_usage_error() {
        let mut config = EdiscoveryConfig::new("/tmp/ediscovery-data");
        config.workers = 0;
        assert!(matches!(config.validate(), Err(EdiscoveryError::Usage(_))));
    }

    #[test]
    fn threshold_low_above_high_is_rejected() {
        let mut config = EdiscoveryConfig::new("/tmp/ediscovery-data");
        config.privilege.threshold_low = 0.9;
        config.privilege.threshold_high = 0.5;
        assert!(matches!(config.validate(), Err(EdiscoveryError::Usage(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EdiscoveryConfig::new("/tmp/ediscovery-data");
        let text = toml::to_string(&config).unwrap();
        let reloaded = EdiscoveryConfig::from_toml_str(&text).unwrap();
        assert_eq!(reloaded.batch_size, config.batch_size);
        assert_eq!(reloaded.data_root, config.data_root);
    }
}

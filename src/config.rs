//! Engine configuration, loaded from `~/.threadlink/config.json`.
//!
//! Every field has a default, so an empty `{}` file (or no file at all via
//! [`EngineConfig::default`]) is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Minimum aggregated score for an automatic link.
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,
    /// Minimum lead of the winner over the runner-up.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    /// Time gap beyond which a divergent provider thread id is suspect.
    #[serde(default = "default_suspect_thread_gap_days")]
    pub suspect_thread_gap_days: i64,
    /// Subject similarity under which a provider thread id may be suspect.
    #[serde(default = "default_thread_similarity_threshold")]
    pub thread_similarity_threshold: f64,
    /// Slack around a project's active window for date proximity.
    #[serde(default = "default_date_grace_days")]
    pub date_grace_days: i64,
    /// Webmail providers; never evidence of an account.
    #[serde(default = "default_public_domains")]
    pub public_domains: Vec<String>,
    /// Bid platforms and notification relays.
    #[serde(default = "default_relay_domains")]
    pub relay_domains: Vec<String>,
    /// The company's own domains.
    #[serde(default)]
    pub internal_domains: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Hard cap on discovered messages.
    #[serde(default = "default_message_budget")]
    pub message_budget: usize,
    /// Issue literal-name queries for entities found in each round.
    #[serde(default = "default_true")]
    pub derive_name_queries: bool,
}

fn default_decision_threshold() -> f64 {
    0.45
}

fn default_ambiguity_margin() -> f64 {
    0.15
}

fn default_suspect_thread_gap_days() -> i64 {
    30
}

fn default_thread_similarity_threshold() -> f64 {
    0.2
}

fn default_date_grace_days() -> i64 {
    14
}

fn default_public_domains() -> Vec<String> {
    [
        "gmail.com",
        "googlemail.com",
        "outlook.com",
        "hotmail.com",
        "live.com",
        "msn.com",
        "yahoo.com",
        "aol.com",
        "icloud.com",
        "me.com",
        "protonmail.com",
        "comcast.net",
        "cox.net",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

fn default_relay_domains() -> Vec<String> {
    [
        "buildingconnected.com",
        "procore.com",
        "procoretech.com",
        "thebluebook.com",
        "bidmail.com",
        "pype.io",
        "planhub.com",
        "smartbidnet.com",
        "docusign.net",
        "sharepoint.com",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

fn default_max_rounds() -> usize {
    5
}

fn default_message_budget() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            message_budget: default_message_budget(),
            derive_name_queries: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_threshold: default_decision_threshold(),
            ambiguity_margin: default_ambiguity_margin(),
            suspect_thread_gap_days: default_suspect_thread_gap_days(),
            thread_similarity_threshold: default_thread_similarity_threshold(),
            date_grace_days: default_date_grace_days(),
            public_domains: default_public_domains(),
            relay_domains: default_relay_domains(),
            internal_domains: Vec::new(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject values the aggregator or discovery cannot work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.thread_similarity_threshold) {
            return Err(EngineError::Configuration(format!(
                "threadSimilarityThreshold must be in [0, 1], got {}",
                self.thread_similarity_threshold
            )));
        }
        if !(self.decision_threshold > 0.0) {
            return Err(EngineError::Configuration(format!(
                "decisionThreshold must be positive, got {}",
                self.decision_threshold
            )));
        }
        if !(self.ambiguity_margin >= 0.0) {
            return Err(EngineError::Configuration(format!(
                "ambiguityMargin must be non-negative, got {}",
                self.ambiguity_margin
            )));
        }
        if self.suspect_thread_gap_days < 0 || self.date_grace_days < 0 {
            return Err(EngineError::Configuration(
                "suspectThreadGapDays and dateGraceDays must be non-negative".to_string(),
            ));
        }
        if self.discovery.max_rounds == 0 || self.discovery.message_budget == 0 {
            return Err(EngineError::Configuration(
                "discovery.maxRounds and discovery.messageBudget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config location: `~/.threadlink/config.json`.
pub fn config_path() -> Result<PathBuf, EngineError> {
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Configuration("Could not find home directory".to_string()))?;
    Ok(home.join(".threadlink").join("config.json"))
}

/// Load and validate the config from the default location.
pub fn load_config() -> Result<EngineConfig, EngineError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<EngineConfig, EngineError> {
    if !path.exists() {
        return Err(EngineError::ConfigNotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Configuration(format!("Failed to read config: {}", e)))?;

    let config: EngineConfig = serde_json::from_str(&content)
        .map_err(|e| EngineError::Configuration(format!("Failed to parse config: {}", e)))?;

    config.validate()?;
    log::debug!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!((config.decision_threshold - 0.45).abs() < f64::EPSILON);
        assert!((config.ambiguity_margin - 0.15).abs() < f64::EPSILON);
        assert_eq!(config.suspect_thread_gap_days, 30);
        assert_eq!(config.discovery.max_rounds, 5);
        assert!(config.public_domains.iter().any(|d| d == "gmail.com"));
        assert!(config.relay_domains.iter().any(|d| d == "procore.com"));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "ambiguityMargin": 0.2, "internalDomains": ["desert.net"], "discovery": { "messageBudget": 50 } }"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert!((config.ambiguity_margin - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.internal_domains, vec!["desert.net"]);
        assert_eq!(config.discovery.message_budget, 50);
        assert_eq!(config.discovery.max_rounds, 5);
    }

    #[test]
    fn test_missing_and_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(load_config_from(&missing), Err(EngineError::ConfigNotFound(_))));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{ "discovery": { "maxRounds": 0 } }"#).unwrap();
        assert!(matches!(load_config_from(&bad), Err(EngineError::Configuration(_))));

        let negative = EngineConfig { ambiguity_margin: -0.1, ..EngineConfig::default() };
        assert!(negative.validate().is_err());
    }
}

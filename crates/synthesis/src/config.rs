//! Synthesis governance configuration
//!
//! Loaded from the operator's mounted ConfigMap. Every section has defaults so
//! a partial (or empty) file yields a working configuration.

use crate::artifact::RetentionPolicy;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Key inside the configuration ConfigMap holding the YAML document
pub const CONFIG_KEY: &str = "synthesis.yaml";

/// Main synthesis configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisConfig {
    /// Per-namespace admission rate
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-namespace daily budgets
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Versioned artifact storage
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// External process hardening
    #[serde(default)]
    pub guard: GuardConfig,

    /// Pricing per model name
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Bucket capacity; also the sustained refill per hour
    #[serde(default = "default_max_synthesis_per_hour")]
    pub max_synthesis_per_hour: u32,
}

fn default_max_synthesis_per_hour() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_synthesis_per_hour: default_max_synthesis_per_hour(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default = "default_max_cost_per_day")]
    pub max_cost_per_day: f64,

    #[serde(default = "default_max_attempts_per_day")]
    pub max_attempts_per_day: u32,

    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_max_cost_per_day() -> f64 {
    10.0
}

fn default_max_attempts_per_day() -> u32 {
    100
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_cost_per_day: default_max_cost_per_day(),
            max_attempts_per_day: default_max_attempts_per_day(),
            currency: default_currency(),
        }
    }
}

/// Artifact storage limits and sweep settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    /// Payloads larger than this are compressed before storage
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// Hard ceiling on the stored payload (ConfigMaps cap at 1 MiB)
    #[serde(default = "default_max_size")]
    pub max_size_bytes: usize,

    /// Image running the `retention-sweep` binary inside the cleanup CronJob
    #[serde(default = "default_sweep_image")]
    pub sweep_image: String,

    /// Policy applied after each successful synthesis
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
}

fn default_compression_threshold() -> usize {
    800 * 1024
}

fn default_max_size() -> usize {
    1024 * 1024
}

fn default_sweep_image() -> String {
    "ghcr.io/language-operator/synthesis:latest".to_string()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: default_compression_threshold(),
            max_size_bytes: default_max_size(),
            sweep_image: default_sweep_image(),
            retention: None,
        }
    }
}

/// Settings for guarded external process execution
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Pinned SHA-256 of the schema validator script
    #[serde(default = "default_validator_script_sha256")]
    pub validator_script_sha256: String,

    /// Candidate locations for the validator script, in order of preference
    #[serde(default = "default_validator_script_paths")]
    pub validator_script_paths: Vec<PathBuf>,

    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,

    /// Fail synthesis when the validator script cannot be located
    #[serde(default)]
    pub require_safety_validation: bool,
}

fn default_validator_script_sha256() -> String {
    "d40378d720f162608fdc81f74fb27e6937dd64e593f0cde24b72b0d92939dc28".to_string()
}

fn default_validator_script_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin/validate-dsl-schema.rb"),
        PathBuf::from("scripts/validate-dsl-schema.rb"),
    ]
}

fn default_command_timeout_seconds() -> u64 {
    5
}

impl GuardConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            validator_script_sha256: default_validator_script_sha256(),
            validator_script_paths: default_validator_script_paths(),
            command_timeout_seconds: default_command_timeout_seconds(),
            require_safety_validation: false,
        }
    }
}

/// Token pricing for one model
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    #[serde(default)]
    pub enabled: bool,

    /// Price per 1000 input tokens
    #[serde(default)]
    pub input_token_cost: f64,

    /// Price per 1000 output tokens
    #[serde(default)]
    pub output_token_cost: f64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

impl SynthesisConfig {
    /// Validate that limits are usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.rate_limit.max_synthesis_per_hour == 0 {
            return Err(anyhow::anyhow!(
                "rateLimit.maxSynthesisPerHour must be greater than zero"
            ));
        }

        if !self.quota.max_cost_per_day.is_finite() || self.quota.max_cost_per_day < 0.0 {
            return Err(anyhow::anyhow!(
                "quota.maxCostPerDay must be a non-negative number"
            ));
        }

        if self.artifacts.compression_threshold_bytes > self.artifacts.max_size_bytes {
            return Err(anyhow::anyhow!(format!(
                "artifacts.compressionThresholdBytes ({}) cannot exceed artifacts.maxSizeBytes ({})",
                self.artifacts.compression_threshold_bytes, self.artifacts.max_size_bytes
            )));
        }

        if self.guard.validator_script_paths.is_empty() {
            return Err(anyhow::anyhow!(
                "guard.validatorScriptPaths must list at least one location"
            ));
        }

        if !matches!(hex::decode(&self.guard.validator_script_sha256), Ok(digest) if digest.len() == 32)
        {
            return Err(anyhow::anyhow!(
                "guard.validatorScriptSha256 must be a hex-encoded SHA-256 digest"
            ));
        }

        for (model, pricing) in &self.models {
            if pricing.input_token_cost < 0.0 || pricing.output_token_cost < 0.0 {
                return Err(anyhow::anyhow!(format!(
                    "Pricing for model '{model}' cannot be negative"
                )));
            }
        }

        Ok(())
    }

    /// Pricing for `model`, if configured
    #[must_use]
    pub fn pricing_for(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: SynthesisConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration through the API server
    pub async fn from_configmap(
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, anyhow::Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;

        let data = cm
            .data
            .ok_or_else(|| anyhow::anyhow!("ConfigMap has no data"))?;
        let config_str = data
            .get(CONFIG_KEY)
            .ok_or_else(|| anyhow::anyhow!("ConfigMap missing {CONFIG_KEY}"))?;

        let config: SynthesisConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
rateLimit:
  maxSynthesisPerHour: 20

quota:
  maxCostPerDay: 5.0
  maxAttemptsPerDay: 50
  currency: "EUR"

artifacts:
  compressionThresholdBytes: 1024
  maxSizeBytes: 4096
  retention:
    keepLastN: 3
    cleanupAfterDays: 30
    alwaysKeepInitial: true
    cleanupIntervalSeconds: 3600

models:
  claude-sonnet:
    enabled: true
    inputTokenCost: 0.003
    outputTokenCost: 0.015
"#;

        let config: SynthesisConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limit.max_synthesis_per_hour, 20);
        assert!((config.quota.max_cost_per_day - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.quota.currency, "EUR");
        assert_eq!(config.artifacts.max_size_bytes, 4096);

        let retention = config.artifacts.retention.as_ref().unwrap();
        assert_eq!(retention.keep_last_n, 3);
        assert!(retention.always_keep_initial);
        assert_eq!(retention.cleanup_interval, Duration::from_secs(3600));

        let pricing = config.pricing_for("claude-sonnet").unwrap();
        assert!(pricing.enabled);
        assert_eq!(pricing.currency, "USD");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = SynthesisConfig::default();
        assert_eq!(config.rate_limit.max_synthesis_per_hour, 10);
        assert_eq!(config.quota.max_attempts_per_day, 100);
        assert_eq!(config.artifacts.compression_threshold_bytes, 800 * 1024);
        assert_eq!(config.artifacts.max_size_bytes, 1024 * 1024);
        assert_eq!(config.guard.command_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: SynthesisConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.quota.currency, "USD");
        assert!(config.models.is_empty());
    }

    #[test]
    fn validate_rejects_threshold_above_ceiling() {
        let mut config = SynthesisConfig::default();
        config.artifacts.compression_threshold_bytes = config.artifacts.max_size_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rate() {
        let mut config = SynthesisConfig::default();
        config.rate_limit.max_synthesis_per_hour = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_mounted_file_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "quota:\n  maxCostPerDay: 2.5").unwrap();

        let config = SynthesisConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap();
        assert!((config.quota.max_cost_per_day - 2.5).abs() < f64::EPSILON);
    }
}

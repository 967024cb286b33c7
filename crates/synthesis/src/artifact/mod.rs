//! # Versioned Agent Code Artifacts
//!
//! Every synthesized revision of an agent's code is stored as its own
//! immutable record named `<owner>-v<version>`. Version numbers are chosen by
//! the caller; the store never increments them. Old versions are retired by
//! [`ArtifactStore::apply_retention_policy`], either inline or from the
//! scheduled sweep installed by [`ArtifactStore::schedule_retention_sweep`].

pub mod backend;
pub mod compression;
pub mod retention;

pub use backend::{
    ArtifactBackend, ArtifactOwner, ArtifactRecord, InMemoryArtifactBackend, KubeArtifactBackend,
    SweepJob, SweepOutcome,
};
pub use compression::{EncodedPayload, COMPRESSION_PREFIX};
pub use retention::RetentionPolicy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::ArtifactConfig;
use crate::error::{Result, SynthesisError};

// Labels
pub const LABEL_AGENT: &str = "langop.io/agent";
pub const LABEL_VERSION: &str = "langop.io/version";
pub const LABEL_SYNTHESIS_TYPE: &str = "langop.io/synthesis-type";
pub const LABEL_COMPONENT: &str = "langop.io/component";
pub const LABEL_PREVIOUS_VERSION: &str = "langop.io/previous-version";
pub const LABEL_LEARNED_TASK: &str = "langop.io/learned-task";

// Annotations
pub const ANNOTATION_CREATED_AT: &str = "langop.io/created-at";
pub const ANNOTATION_LEARNED_FROM: &str = "langop.io/learned-from";
pub const ANNOTATION_COMPRESSED: &str = "langop.io/compressed";
pub const ANNOTATION_ORIGINAL_SIZE: &str = "langop.io/original-size";
pub const ANNOTATION_COMPRESSION_RATIO: &str = "langop.io/compression-ratio";

pub const COMPONENT_AGENT_CODE: &str = "agent-code";
pub const COMPONENT_SWEEP: &str = "configmap-cleanup";

/// Data key holding the agent code
pub const DATA_KEY: &str = "agent.rb";

/// Path of the sweep binary inside the sweep image
pub const SWEEP_BINARY: &str = "/usr/local/bin/retention-sweep";

/// How a version came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisType {
    Initial,
    Learned,
    Manual,
}

impl SynthesisType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Learned => "learned",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SynthesisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynthesisType {
    type Err = SynthesisError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "initial" => Ok(Self::Initial),
            "learned" => Ok(Self::Learned),
            "manual" => Ok(Self::Manual),
            other => Err(SynthesisError::InvalidArgument(format!(
                "unknown synthesis type: {other}"
            ))),
        }
    }
}

/// Input to [`ArtifactStore::create_version`]
#[derive(Debug, Clone, PartialEq)]
pub struct VersionOptions {
    pub code: String,
    /// Must be positive
    pub version: i32,
    pub synthesis_type: SynthesisType,
    pub previous_version: Option<i32>,
    /// Task that triggered a learned version
    pub learned_task: Option<String>,
    /// e.g. `pattern-detection`, `error-recovery`, `manual`
    pub learning_source: Option<String>,
    pub custom_annotations: BTreeMap<String, String>,
}

impl VersionOptions {
    #[must_use]
    pub fn new(code: impl Into<String>, version: i32, synthesis_type: SynthesisType) -> Self {
        Self {
            code: code.into(),
            version,
            synthesis_type,
            previous_version: None,
            learned_task: None,
            learning_source: None,
            custom_annotations: BTreeMap::new(),
        }
    }
}

/// Parsed metadata of one stored version
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactVersion {
    pub name: String,
    pub version: i32,
    pub synthesis_type: SynthesisType,
    pub previous_version: Option<i32>,
    pub learned_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub compressed: bool,
    pub original_size: usize,
}

impl ArtifactVersion {
    fn parse(record: &ArtifactRecord) -> Result<Self> {
        let version_label = record.labels.get(LABEL_VERSION).ok_or_else(|| {
            SynthesisError::Encoding(format!("{} is missing the {LABEL_VERSION} label", record.name))
        })?;
        let version: i32 = version_label.parse().map_err(|_| {
            SynthesisError::Encoding(format!(
                "{} has an invalid version label: {version_label}",
                record.name
            ))
        })?;

        let synthesis_type = record
            .labels
            .get(LABEL_SYNTHESIS_TYPE)
            .ok_or_else(|| {
                SynthesisError::Encoding(format!(
                    "{} is missing the {LABEL_SYNTHESIS_TYPE} label",
                    record.name
                ))
            })?
            .parse()?;

        let created_at = record
            .annotations
            .get(ANNOTATION_CREATED_AT)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .or(record.created_at)
            .ok_or_else(|| {
                SynthesisError::Encoding(format!("{} has no creation time", record.name))
            })?;

        let compressed = record
            .annotations
            .get(ANNOTATION_COMPRESSED)
            .is_some_and(|value| value == "true");
        let original_size = record
            .annotations
            .get(ANNOTATION_ORIGINAL_SIZE)
            .and_then(|value| value.parse().ok())
            .unwrap_or(record.data.len());

        Ok(Self {
            name: record.name.clone(),
            version,
            synthesis_type,
            previous_version: record
                .labels
                .get(LABEL_PREVIOUS_VERSION)
                .and_then(|value| value.parse().ok()),
            learned_task: record.labels.get(LABEL_LEARNED_TASK).cloned(),
            created_at,
            labels: record.labels.clone(),
            annotations: record.annotations.clone(),
            compressed,
            original_size,
        })
    }
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub total: usize,
    pub deleted: Vec<i32>,
    pub failed: Vec<i32>,
}

/// Record name for an owner's version
#[must_use]
pub fn version_name(owner: &str, version: i32) -> String {
    format!("{owner}-v{version}")
}

/// Name of the owner's scheduled sweep job
#[must_use]
pub fn sweep_job_name(owner: &str) -> String {
    format!("{owner}-configmap-cleanup")
}

/// Versioned artifact storage for generated agent code
pub struct ArtifactStore {
    backend: Arc<dyn ArtifactBackend>,
    compression_threshold: usize,
    max_size: usize,
    sweep_image: String,
    clock: SharedClock,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(backend: Arc<dyn ArtifactBackend>, config: &ArtifactConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        backend: Arc<dyn ArtifactBackend>,
        config: &ArtifactConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            backend,
            compression_threshold: config.compression_threshold_bytes,
            max_size: config.max_size_bytes,
            sweep_image: config.sweep_image.clone(),
            clock,
        }
    }

    /// Store a new immutable version of `owner`'s code
    #[instrument(skip(self, owner, options), fields(owner = %owner.name, namespace = %owner.namespace))]
    pub async fn create_version(
        &self,
        owner: &ArtifactOwner,
        options: Option<&VersionOptions>,
    ) -> Result<ArtifactVersion> {
        let options = options.ok_or_else(|| {
            SynthesisError::InvalidArgument("version options are required".to_string())
        })?;
        if options.version <= 0 {
            return Err(SynthesisError::InvalidArgument(format!(
                "version must be positive, got: {}",
                options.version
            )));
        }

        let name = version_name(&owner.name, options.version);
        let payload = compression::encode(&options.code, self.compression_threshold)?;

        if payload.data.len() > self.max_size {
            warn!(
                artifact = %name,
                size = payload.data.len(),
                max_size = self.max_size,
                compressed = payload.compressed,
                "Artifact exceeds size limit"
            );
            return Err(SynthesisError::SizeExceeded {
                name,
                actual_size: payload.data.len(),
                max_size: self.max_size,
                compressed: payload.compressed,
                original_size: payload.original_size,
            });
        }

        let mut labels = BTreeMap::from([
            (LABEL_AGENT.to_string(), owner.name.clone()),
            (LABEL_VERSION.to_string(), options.version.to_string()),
            (
                LABEL_SYNTHESIS_TYPE.to_string(),
                options.synthesis_type.to_string(),
            ),
            (LABEL_COMPONENT.to_string(), COMPONENT_AGENT_CODE.to_string()),
        ]);
        if let Some(task) = options.learned_task.as_deref().filter(|t| !t.is_empty()) {
            labels.insert(LABEL_LEARNED_TASK.to_string(), task.to_string());
        }
        if let Some(previous) = options.previous_version.filter(|v| *v > 0) {
            labels.insert(LABEL_PREVIOUS_VERSION.to_string(), previous.to_string());
        }

        // Custom annotations go in first so they cannot mask store metadata.
        let mut annotations = options.custom_annotations.clone();
        annotations.insert(
            ANNOTATION_CREATED_AT.to_string(),
            self.clock.now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        annotations.insert(
            ANNOTATION_LEARNED_FROM.to_string(),
            options.learning_source.clone().unwrap_or_default(),
        );
        if payload.compressed {
            annotations.insert(ANNOTATION_COMPRESSED.to_string(), "true".to_string());
            annotations.insert(
                ANNOTATION_ORIGINAL_SIZE.to_string(),
                payload.original_size.to_string(),
            );
            annotations.insert(
                ANNOTATION_COMPRESSION_RATIO.to_string(),
                format!("{:.2}", payload.compression_ratio()),
            );
        }

        let record = ArtifactRecord {
            name: name.clone(),
            labels,
            annotations,
            data: payload.data,
            created_at: None,
        };

        let created = self.backend.create(owner, record).await?;
        let version = ArtifactVersion::parse(&created)?;

        info!(
            artifact = %name,
            version = options.version,
            synthesis_type = %options.synthesis_type,
            learned_task = options.learned_task.as_deref().unwrap_or(""),
            compressed = version.compressed,
            "Created versioned artifact"
        );
        Ok(version)
    }

    /// Every parseable version of `owner`'s code, in backend order
    #[instrument(skip(self, owner), fields(owner = %owner.name, namespace = %owner.namespace))]
    pub async fn versions(&self, owner: &ArtifactOwner) -> Result<Vec<ArtifactVersion>> {
        let records = self.backend.list(owner).await?;

        let versions: Vec<_> = records
            .iter()
            .filter_map(|record| match ArtifactVersion::parse(record) {
                Ok(version) => Some(version),
                Err(e) => {
                    warn!(artifact = %record.name, error = %e, "Skipping malformed artifact");
                    None
                }
            })
            .collect();

        debug!(found = versions.len(), "Listed artifact versions");
        Ok(versions)
    }

    /// Highest stored version, or 0 when none exist
    pub async fn latest_version(&self, owner: &ArtifactOwner) -> Result<i32> {
        Ok(self
            .versions(owner)
            .await?
            .iter()
            .map(|version| version.version)
            .max()
            .unwrap_or(0))
    }

    /// The original code of a stored version. Only records annotated as
    /// compressed are decoded.
    pub async fn read_code(&self, owner: &ArtifactOwner, version: i32) -> Result<String> {
        let record = self
            .backend
            .get(&owner.namespace, &version_name(&owner.name, version))
            .await?;

        let compressed = record
            .annotations
            .get(ANNOTATION_COMPRESSED)
            .is_some_and(|value| value == "true");
        if compressed {
            compression::decode(&record.data)
        } else {
            Ok(record.data)
        }
    }

    /// Delete the versions `policy` no longer keeps. Individual delete
    /// failures are logged and reported, not returned.
    #[instrument(skip(self, owner, policy), fields(owner = %owner.name, namespace = %owner.namespace))]
    pub async fn apply_retention_policy(
        &self,
        owner: &ArtifactOwner,
        policy: Option<&RetentionPolicy>,
    ) -> Result<RetentionReport> {
        let Some(policy) = policy else {
            return Ok(RetentionReport::default());
        };

        let versions = self.versions(owner).await?;
        let mut report = RetentionReport {
            total: versions.len(),
            ..Default::default()
        };

        for version in policy.select_for_deletion(&versions, self.clock.now()) {
            match self.backend.delete(&owner.namespace, &version.name).await {
                Ok(()) => {
                    debug!(artifact = %version.name, version = version.version, "Deleted artifact version");
                    report.deleted.push(version.version);
                }
                Err(e) if e.is_not_found() => report.deleted.push(version.version),
                Err(e) => {
                    warn!(
                        artifact = %version.name,
                        version = version.version,
                        error = %e,
                        "Failed to delete artifact during retention cleanup"
                    );
                    report.failed.push(version.version);
                }
            }
        }

        if !report.deleted.is_empty() {
            info!(
                total_versions = report.total,
                deleted_versions = report.deleted.len(),
                failed_versions = report.failed.len(),
                "Applied retention policy"
            );
        }
        Ok(report)
    }

    /// Create or update the owner's periodic sweep. Returns `None` when the
    /// policy has no interval.
    #[instrument(skip(self, owner, policy), fields(owner = %owner.name, namespace = %owner.namespace))]
    pub async fn schedule_retention_sweep(
        &self,
        owner: &ArtifactOwner,
        policy: Option<&RetentionPolicy>,
    ) -> Result<Option<SweepOutcome>> {
        let Some((policy, schedule)) =
            policy.and_then(|policy| policy.cron_schedule().map(|schedule| (policy, schedule)))
        else {
            return Ok(None);
        };

        let job = SweepJob {
            name: sweep_job_name(&owner.name),
            schedule: schedule.to_string(),
            image: self.sweep_image.clone(),
            command: sweep_command(owner, policy),
            labels: BTreeMap::from([
                (LABEL_AGENT.to_string(), owner.name.clone()),
                (LABEL_COMPONENT.to_string(), COMPONENT_SWEEP.to_string()),
            ]),
        };

        let outcome = self.backend.apply_sweep(owner, job).await?;
        Ok(Some(outcome))
    }
}

fn sweep_command(owner: &ArtifactOwner, policy: &RetentionPolicy) -> Vec<String> {
    vec![
        SWEEP_BINARY.to_string(),
        "--agent".to_string(),
        owner.name.clone(),
        "--namespace".to_string(),
        owner.namespace.clone(),
        "--keep-last".to_string(),
        policy.keep_last_n.to_string(),
        "--cleanup-after-days".to_string(),
        policy.cleanup_after_days.to_string(),
        format!("--always-keep-initial={}", policy.always_keep_initial),
    ]
}

//! Storage backends for versioned artifacts.
//!
//! [`KubeArtifactBackend`] keeps each version in its own ConfigMap and the
//! retention sweep in a CronJob. [`InMemoryArtifactBackend`] mirrors the same
//! conflict and not-found semantics without a cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{COMPONENT_AGENT_CODE, DATA_KEY, LABEL_AGENT, LABEL_COMPONENT};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, SynthesisError};

const CONFIG_MAP: &str = "ConfigMap";
const CRON_JOB: &str = "CronJob";

/// The agent that owns a set of artifact versions
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactOwner {
    pub name: String,
    pub namespace: String,
    /// Attached to every record so the platform garbage-collects them with the owner
    pub reference: Option<OwnerReference>,
}

impl ArtifactOwner {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            reference: None,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: OwnerReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// A stored artifact as the backend sees it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArtifactRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: String,
    /// Backend-assigned creation time
    pub created_at: Option<DateTime<Utc>>,
}

/// Desired state of an owner's scheduled retention sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SweepJob {
    pub name: String,
    pub schedule: String,
    pub image: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Created,
    Updated,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` on a name conflict.
    async fn create(&self, owner: &ArtifactOwner, record: ArtifactRecord) -> Result<ArtifactRecord>;

    /// Fetch one record. Fails with `NotFound` when absent.
    async fn get(&self, namespace: &str, name: &str) -> Result<ArtifactRecord>;

    /// All agent-code records belonging to `owner`.
    async fn list(&self, owner: &ArtifactOwner) -> Result<Vec<ArtifactRecord>>;

    /// Remove one record. Fails with `NotFound` when absent.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create the sweep job or bring an existing one up to date.
    async fn apply_sweep(&self, owner: &ArtifactOwner, job: SweepJob) -> Result<SweepOutcome>;
}

/// Process-local backend
pub struct InMemoryArtifactBackend {
    records: Mutex<BTreeMap<(String, String), ArtifactRecord>>,
    sweeps: Mutex<BTreeMap<(String, String), SweepJob>>,
    clock: SharedClock,
}

impl Default for InMemoryArtifactBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArtifactBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(std::sync::Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            sweeps: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Store a record as-is, bypassing conflict checks.
    pub fn insert_raw(&self, namespace: &str, record: ArtifactRecord) {
        self.records
            .lock()
            .insert((namespace.to_string(), record.name.clone()), record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    #[must_use]
    pub fn sweep(&self, namespace: &str, name: &str) -> Option<SweepJob> {
        self.sweeps
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ArtifactBackend for InMemoryArtifactBackend {
    async fn create(&self, owner: &ArtifactOwner, mut record: ArtifactRecord) -> Result<ArtifactRecord> {
        let key = (owner.namespace.clone(), record.name.clone());
        let mut records = self.records.lock();
        if records.contains_key(&key) {
            return Err(SynthesisError::AlreadyExists {
                kind: CONFIG_MAP,
                name: record.name,
            });
        }

        record.created_at.get_or_insert_with(|| self.clock.now());
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ArtifactRecord> {
        self.records
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SynthesisError::NotFound {
                kind: CONFIG_MAP,
                name: name.to_string(),
            })
    }

    async fn list(&self, owner: &ArtifactOwner) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|((namespace, _), record)| {
                *namespace == owner.namespace
                    && record.labels.get(LABEL_AGENT) == Some(&owner.name)
                    && record.labels.get(LABEL_COMPONENT).map(String::as_str)
                        == Some(COMPONENT_AGENT_CODE)
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.records
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| SynthesisError::NotFound {
                kind: CONFIG_MAP,
                name: name.to_string(),
            })
    }

    async fn apply_sweep(&self, owner: &ArtifactOwner, job: SweepJob) -> Result<SweepOutcome> {
        let key = (owner.namespace.clone(), job.name.clone());
        let previous = self.sweeps.lock().insert(key, job);
        Ok(if previous.is_some() {
            SweepOutcome::Updated
        } else {
            SweepOutcome::Created
        })
    }
}

/// ConfigMap and CronJob backed storage
#[derive(Clone)]
pub struct KubeArtifactBackend {
    client: Client,
}

impl KubeArtifactBackend {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn configmaps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cronjobs(&self, namespace: &str) -> Api<CronJob> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn to_configmap(owner: &ArtifactOwner, record: &ArtifactRecord) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(record.name.clone()),
                namespace: Some(owner.namespace.clone()),
                labels: Some(record.labels.clone()),
                annotations: Some(record.annotations.clone()),
                owner_references: owner.reference.clone().map(|reference| vec![reference]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(DATA_KEY.to_string(), record.data.clone())])),
            ..Default::default()
        }
    }

    fn from_configmap(configmap: ConfigMap) -> ArtifactRecord {
        let metadata = configmap.metadata;
        ArtifactRecord {
            name: metadata.name.unwrap_or_default(),
            labels: metadata.labels.unwrap_or_default(),
            annotations: metadata.annotations.unwrap_or_default(),
            data: configmap
                .data
                .and_then(|mut data| data.remove(DATA_KEY))
                .unwrap_or_default(),
            created_at: metadata.creation_timestamp.map(|time| time.0),
        }
    }

    fn to_cronjob(owner: &ArtifactOwner, job: &SweepJob) -> CronJob {
        let resources = ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("10m".to_string())),
                ("memory".to_string(), Quantity("32Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("100m".to_string())),
                ("memory".to_string(), Quantity("128Mi".to_string())),
            ])),
            ..Default::default()
        };

        CronJob {
            metadata: ObjectMeta {
                name: Some(job.name.clone()),
                namespace: Some(owner.namespace.clone()),
                labels: Some(job.labels.clone()),
                owner_references: owner.reference.clone().map(|reference| vec![reference]),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                schedule: job.schedule.clone(),
                concurrency_policy: Some("Forbid".to_string()),
                job_template: JobTemplateSpec {
                    spec: Some(JobSpec {
                        template: PodTemplateSpec {
                            spec: Some(PodSpec {
                                restart_policy: Some("OnFailure".to_string()),
                                containers: vec![Container {
                                    name: "cleanup".to_string(),
                                    image: Some(job.image.clone()),
                                    command: Some(job.command.clone()),
                                    resources: Some(resources),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ArtifactBackend for KubeArtifactBackend {
    async fn create(&self, owner: &ArtifactOwner, record: ArtifactRecord) -> Result<ArtifactRecord> {
        let configmap = Self::to_configmap(owner, &record);

        match self
            .configmaps(&owner.namespace)
            .create(&PostParams::default(), &configmap)
            .await
        {
            Ok(created) => {
                debug!(configmap = %record.name, namespace = %owner.namespace, "Created ConfigMap");
                Ok(Self::from_configmap(created))
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(SynthesisError::AlreadyExists {
                kind: CONFIG_MAP,
                name: record.name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ArtifactRecord> {
        match self.configmaps(namespace).get(name).await {
            Ok(configmap) => Ok(Self::from_configmap(configmap)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(SynthesisError::NotFound {
                kind: CONFIG_MAP,
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, owner: &ArtifactOwner) -> Result<Vec<ArtifactRecord>> {
        let list_params = ListParams::default().labels(&format!(
            "{LABEL_AGENT}={},{LABEL_COMPONENT}={COMPONENT_AGENT_CODE}",
            owner.name
        ));

        let configmaps = self.configmaps(&owner.namespace).list(&list_params).await?;
        Ok(configmaps
            .items
            .into_iter()
            .map(Self::from_configmap)
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .configmaps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(SynthesisError::NotFound {
                kind: CONFIG_MAP,
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_sweep(&self, owner: &ArtifactOwner, job: SweepJob) -> Result<SweepOutcome> {
        let api = self.cronjobs(&owner.namespace);
        let desired = Self::to_cronjob(owner, &job);

        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => {
                info!(cronjob = %job.name, schedule = %job.schedule, "Created retention sweep CronJob");
                Ok(SweepOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let mut existing = api.get(&job.name).await?;
                existing.spec = desired.spec;
                existing.metadata.labels = desired.metadata.labels;
                api.replace(&job.name, &PostParams::default(), &existing)
                    .await
                    .map_err(|e| match e {
                        kube::Error::Api(ae) if ae.code == 409 => SynthesisError::Backend(format!(
                            "{CRON_JOB} {} changed while updating, retry: {}",
                            job.name, ae.message
                        )),
                        other => other.into(),
                    })?;
                debug!(cronjob = %job.name, schedule = %job.schedule, "Updated retention sweep CronJob");
                Ok(SweepOutcome::Updated)
            }
            Err(e) => Err(e.into()),
        }
    }
}

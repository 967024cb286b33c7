//! # Synthesis Governor
//!
//! Single entry point reconcilers call to turn a prompt into a stored agent
//! code version. Runs admission control, quota pre-checks, generation,
//! accounting, safety validation, versioned storage and retention in that
//! order, and reports every outcome to the metrics sink.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::artifact::{
    ArtifactBackend, ArtifactOwner, ArtifactStore, ArtifactVersion, RetentionPolicy,
    RetentionReport, SynthesisType, VersionOptions,
};
use crate::clock::SharedClock;
use crate::config::SynthesisConfig;
use crate::cost::{CostTracker, SynthesisCost};
use crate::error::{Result, SynthesisError};
use crate::metrics::{NoopMetrics, RequestStatus, SynthesisMetrics, TokenDirection};
use crate::quota::QuotaManager;
use crate::rate_limit::RateLimiter;
use crate::safety::{CodeSafetyValidator, SchemaScriptValidator};

/// What a [`CodeGenerator`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    pub code: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Black-box LLM code generation
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &SynthesisRequest) -> Result<GeneratedCode>;
}

/// One request to synthesize a new version of an agent's code
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub owner: ArtifactOwner,
    pub prompt: String,
    pub model_name: String,
    /// Used to price the request before it runs
    pub expected_output_tokens: u64,
    /// Ignored for an agent's first version, which is always `Initial`
    pub synthesis_type: SynthesisType,
    pub learned_task: Option<String>,
    pub learning_source: Option<String>,
    /// Overrides the configured default policy
    pub retention: Option<RetentionPolicy>,
}

impl SynthesisRequest {
    #[must_use]
    pub fn new(owner: ArtifactOwner, prompt: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            owner,
            prompt: prompt.into(),
            model_name: model_name.into(),
            expected_output_tokens: 0,
            synthesis_type: SynthesisType::Initial,
            learned_task: None,
            learning_source: None,
            retention: None,
        }
    }
}

/// Result of a successful synthesis
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub version: ArtifactVersion,
    pub cost: SynthesisCost,
    pub retention: Option<RetentionReport>,
}

/// Wires admission, quotas, generation, validation and storage together
pub struct SynthesisGovernor {
    config: SynthesisConfig,
    rate_limiter: RateLimiter,
    quotas: QuotaManager,
    store: ArtifactStore,
    generator: Arc<dyn CodeGenerator>,
    validator: Arc<dyn CodeSafetyValidator>,
    metrics: Arc<dyn SynthesisMetrics>,
}

impl SynthesisGovernor {
    pub fn new(
        config: SynthesisConfig,
        backend: Arc<dyn ArtifactBackend>,
        generator: Arc<dyn CodeGenerator>,
        clock: SharedClock,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SynthesisError::Config(e.to_string()))?;

        Ok(Self {
            rate_limiter: RateLimiter::with_clock(
                config.rate_limit.max_synthesis_per_hour,
                Arc::clone(&clock),
            )?,
            quotas: QuotaManager::from_config(&config.quota, Arc::clone(&clock)),
            store: ArtifactStore::with_clock(backend, &config.artifacts, clock),
            validator: Arc::new(SchemaScriptValidator::from_config(&config.guard)),
            metrics: Arc::new(NoopMetrics),
            generator,
            config,
        })
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn CodeSafetyValidator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn SynthesisMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run one synthesis end to end
    #[instrument(skip(self, request), fields(agent = %request.owner.name, namespace = %request.owner.namespace))]
    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutcome> {
        let started = Instant::now();
        let namespace = request.owner.namespace.as_str();

        let result = self.run(request).await;

        let status = match &result {
            Ok(_) => RequestStatus::Success,
            Err(SynthesisError::AdmissionDenied { .. }) => RequestStatus::RateLimited,
            Err(SynthesisError::QuotaExceeded(_)) => RequestStatus::QuotaExceeded,
            Err(SynthesisError::SafetyViolations(_)) => RequestStatus::Rejected,
            Err(_) => RequestStatus::Failed,
        };
        self.metrics.record_request(namespace, status);
        self.metrics
            .observe_duration(namespace, status, started.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, request: &SynthesisRequest) -> Result<SynthesisOutcome> {
        let namespace = request.owner.namespace.as_str();
        let agent = request.owner.name.as_str();

        if let Err(e) = self.rate_limiter.check_and_consume(namespace) {
            self.metrics.record_rate_limited(namespace);
            return Err(e);
        }

        let tracker = CostTracker::new(self.config.pricing_for(&request.model_name));
        let estimate = tracker.estimate_cost(
            &request.prompt,
            request.expected_output_tokens,
            &request.model_name,
        );

        let admitted = self
            .quotas
            .check_cost_quota(namespace, estimate.total_cost)
            .and_then(|()| self.quotas.check_attempt_quota(namespace));
        if let Err(e) = admitted {
            if let SynthesisError::QuotaExceeded(violation) = &e {
                self.metrics.record_quota_exceeded(namespace, violation.kind());
            }
            return Err(e);
        }

        let generated = match self.generator.generate(request).await {
            Ok(generated) => generated,
            Err(e) => {
                let message = e.to_string();
                self.quotas
                    .record_attempt(namespace, agent, false, Some(&message));
                warn!(error = %message, "Code generation failed");
                return Err(e);
            }
        };

        let cost = tracker.calculate_cost(
            generated.input_tokens,
            generated.output_tokens,
            &request.model_name,
        );
        self.quotas.record_cost(namespace, agent, &cost);
        self.quotas.record_attempt(namespace, agent, true, None);
        self.report_usage(namespace, &cost);

        let violations = self.validator.validate(&generated.code).await?;
        if !violations.is_empty() {
            warn!(violations = violations.len(), "Rejecting generated code");
            return Err(SynthesisError::SafetyViolations(violations));
        }

        let latest = self.store.latest_version(&request.owner).await?;
        let next = latest + 1;
        let options = VersionOptions {
            code: generated.code,
            version: next,
            synthesis_type: if next == 1 {
                SynthesisType::Initial
            } else {
                request.synthesis_type
            },
            previous_version: (latest > 0).then_some(latest),
            learned_task: request.learned_task.clone(),
            learning_source: request.learning_source.clone(),
            custom_annotations: Default::default(),
        };
        let version = self.store.create_version(&request.owner, Some(&options)).await?;

        let policy = request
            .retention
            .as_ref()
            .or(self.config.artifacts.retention.as_ref());
        let retention = match self.store.apply_retention_policy(&request.owner, policy).await {
            Ok(report) => policy.map(|_| report),
            Err(e) => {
                warn!(error = %e, "Retention cleanup failed; keeping all versions");
                None
            }
        };

        info!(
            version = version.version,
            synthesis_type = %version.synthesis_type,
            cost = cost.total_cost,
            currency = %cost.currency,
            "Agent code synthesized"
        );

        Ok(SynthesisOutcome {
            version,
            cost,
            retention,
        })
    }

    fn report_usage(&self, namespace: &str, cost: &SynthesisCost) {
        self.metrics
            .record_tokens(namespace, TokenDirection::Input, cost.input_tokens);
        self.metrics
            .record_tokens(namespace, TokenDirection::Output, cost.output_tokens);
        self.metrics.record_cost(namespace, cost.total_cost);

        let remaining = self.quotas.remaining_quota(namespace);
        self.metrics
            .set_quota_remaining(namespace, "cost", remaining.cost);
        self.metrics
            .set_quota_remaining(namespace, "attempts", f64::from(remaining.attempts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::InMemoryArtifactBackend;
    use crate::clock::ManualClock;
    use crate::config::ModelPricing;
    use crate::metrics::InMemoryMetrics;
    use crate::safety::{NoopValidator, Violation};
    use crate::QuotaViolation;

    struct FixedGenerator {
        code: String,
    }

    #[async_trait]
    impl CodeGenerator for FixedGenerator {
        async fn generate(&self, _request: &SynthesisRequest) -> Result<GeneratedCode> {
            Ok(GeneratedCode {
                code: self.code.clone(),
                input_tokens: 2000,
                output_tokens: 1000,
            })
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl CodeGenerator for FailingGenerator {
        async fn generate(&self, _request: &SynthesisRequest) -> Result<GeneratedCode> {
            Err(SynthesisError::Generation("model endpoint unavailable".to_string()))
        }
    }

    struct RejectingValidator;

    #[async_trait]
    impl CodeSafetyValidator for RejectingValidator {
        async fn validate(&self, _code: &str) -> Result<Vec<Violation>> {
            Ok(vec![Violation {
                kind: "dangerous_method".to_string(),
                property: Some("system".to_string()),
                location: 3,
                message: "system calls are not allowed".to_string(),
            }])
        }
    }

    fn config() -> SynthesisConfig {
        let mut config = SynthesisConfig::default();
        config.models.insert(
            "claude-sonnet".to_string(),
            ModelPricing {
                enabled: true,
                input_token_cost: 0.003,
                output_token_cost: 0.015,
                currency: "USD".to_string(),
            },
        );
        config
    }

    struct Harness {
        governor: SynthesisGovernor,
        backend: Arc<InMemoryArtifactBackend>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn harness(config: SynthesisConfig, generator: Arc<dyn CodeGenerator>) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let backend = Arc::new(InMemoryArtifactBackend::with_clock(Arc::clone(&clock)));
        let metrics = Arc::new(InMemoryMetrics::new());
        let governor = SynthesisGovernor::new(config, backend.clone(), generator, clock)
            .unwrap()
            .with_validator(Arc::new(NoopValidator))
            .with_metrics(metrics.clone());
        Harness {
            governor,
            backend,
            metrics,
        }
    }

    fn request() -> SynthesisRequest {
        let mut request = SynthesisRequest::new(
            ArtifactOwner::new("weather-agent", "demo"),
            "Build an agent that reports the weather",
            "claude-sonnet",
        );
        request.expected_output_tokens = 1000;
        request
    }

    fn fixed(code: &str) -> Arc<dyn CodeGenerator> {
        Arc::new(FixedGenerator {
            code: code.to_string(),
        })
    }

    #[tokio::test]
    async fn first_synthesis_is_initial_then_learned() {
        let h = harness(config(), fixed("agent 'weather' do\nend\n"));

        let first = h.governor.synthesize(&request()).await.unwrap();
        assert_eq!(first.version.version, 1);
        assert_eq!(first.version.synthesis_type, SynthesisType::Initial);
        assert!((first.cost.total_cost - 0.021).abs() < 1e-9);

        let mut learned = request();
        learned.synthesis_type = SynthesisType::Learned;
        learned.learned_task = Some("fetch-forecast".to_string());
        let second = h.governor.synthesize(&learned).await.unwrap();
        assert_eq!(second.version.version, 2);
        assert_eq!(second.version.synthesis_type, SynthesisType::Learned);
        assert_eq!(second.version.previous_version, Some(1));
        assert_eq!(second.version.learned_task.as_deref(), Some("fetch-forecast"));

        assert_eq!(h.metrics.requests("demo", RequestStatus::Success), 2);
        assert_eq!(h.metrics.tokens("demo", TokenDirection::Input), 4000);
        assert_eq!(h.metrics.duration_count("demo"), 2);
        let remaining = h.metrics.quota_remaining("demo", "cost").unwrap();
        assert!((remaining - (10.0 - 0.042)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rate_limited_requests_are_counted() {
        let mut config = config();
        config.rate_limit.max_synthesis_per_hour = 1;
        let h = harness(config, fixed("code"));

        h.governor.synthesize(&request()).await.unwrap();
        let err = h.governor.synthesize(&request()).await.unwrap_err();

        assert!(matches!(err, SynthesisError::AdmissionDenied { .. }));
        assert!(err.is_retryable());
        assert_eq!(h.metrics.rate_limited("demo"), 1);
        assert_eq!(h.metrics.requests("demo", RequestStatus::RateLimited), 1);
        assert_eq!(h.backend.len(), 1);
    }

    #[tokio::test]
    async fn cost_quota_blocks_before_generation() {
        let mut config = config();
        config.quota.max_cost_per_day = 0.001;
        let h = harness(config, fixed("code"));

        let err = h.governor.synthesize(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::QuotaExceeded(QuotaViolation::Cost { .. })
        ));
        assert_eq!(h.metrics.quota_exceeded("demo", "cost"), 1);
        assert!(h.backend.is_empty());
        // Nothing was generated, so no attempt was charged.
        assert_eq!(
            h.governor.quotas().remaining_quota("demo").attempts,
            h.governor.config.quota.max_attempts_per_day
        );
    }

    #[tokio::test]
    async fn attempt_quota_blocks_after_limit() {
        let mut config = config();
        config.quota.max_attempts_per_day = 1;
        let h = harness(config, fixed("code"));

        h.governor.synthesize(&request()).await.unwrap();
        let err = h.governor.synthesize(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::QuotaExceeded(QuotaViolation::Attempts { .. })
        ));
        assert_eq!(h.metrics.quota_exceeded("demo", "attempts"), 1);
    }

    #[tokio::test]
    async fn generation_failure_records_failed_attempt() {
        let h = harness(config(), Arc::new(FailingGenerator));

        let err = h.governor.synthesize(&request()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Generation(_)));
        assert!(!err.is_retryable());

        let stats = h.governor.quotas().namespace_stats("demo").unwrap();
        assert_eq!(stats.daily_attempts, 1);
        assert!(stats.daily_cost.abs() < f64::EPSILON);
        assert_eq!(h.metrics.requests("demo", RequestStatus::Failed), 1);

        let history = h.governor.quotas().attempt_history("demo");
        assert!(!history[0].success);
        assert!(history[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("model endpoint unavailable"));
    }

    #[tokio::test]
    async fn unsafe_code_is_not_stored() {
        let h = harness(config(), fixed("system('rm -rf /')"));
        let governor = h.governor.with_validator(Arc::new(RejectingValidator));

        let err = governor.synthesize(&request()).await.unwrap_err();
        match err {
            SynthesisError::SafetyViolations(violations) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].property.as_deref(), Some("system"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.backend.is_empty());
        assert_eq!(h.metrics.requests("demo", RequestStatus::Rejected), 1);
        // The model was still called and billed.
        assert!(governor.quotas().namespace_stats("demo").unwrap().daily_cost > 0.0);
    }

    #[tokio::test]
    async fn configured_retention_runs_after_each_synthesis() {
        let mut config = config();
        config.artifacts.retention = Some(RetentionPolicy {
            keep_last_n: 2,
            always_keep_initial: true,
            ..Default::default()
        });
        let h = harness(config, fixed("code"));

        for _ in 0..4 {
            h.governor.synthesize(&request()).await.unwrap();
        }

        let mut versions: Vec<i32> = h
            .governor
            .store()
            .versions(&request().owner)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version)
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 3, 4]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = config();
        config.rate_limit.max_synthesis_per_hour = 0;
        let clock: SharedClock = Arc::new(ManualClock::default());
        let result = SynthesisGovernor::new(
            config,
            Arc::new(InMemoryArtifactBackend::new()),
            fixed("code"),
            clock,
        );
        assert!(matches!(result, Err(SynthesisError::Config(_))));
    }
}

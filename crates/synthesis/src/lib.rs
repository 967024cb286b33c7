//! # Synthesis Governance
//!
//! Governs LLM-driven agent code synthesis for the language operator:
//!
//! - [`rate_limit`]: per-namespace token-bucket admission
//! - [`quota`]: per-namespace daily cost and attempt budgets
//! - [`cost`]: token pricing
//! - [`artifact`]: immutable versioned code storage with compression and retention
//! - [`guard`]: allowlisted, integrity-checked external process execution
//! - [`safety`]: pluggable validation of generated code
//! - [`governor`]: the pipeline tying the above together
//!
//! All state is in-process and per operator instance. Components are built
//! from a [`SynthesisConfig`] and shared by reference or `Arc`.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod governor;
pub mod guard;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod safety;
pub mod telemetry;

pub use artifact::{
    ArtifactOwner, ArtifactStore, ArtifactVersion, RetentionPolicy, RetentionReport,
    SynthesisType, VersionOptions,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SynthesisConfig;
pub use cost::{CostTracker, SynthesisCost};
pub use error::{QuotaViolation, Result, SynthesisError};
pub use governor::{CodeGenerator, GeneratedCode, SynthesisGovernor, SynthesisOutcome, SynthesisRequest};
pub use guard::CommandGuard;
pub use metrics::{InMemoryMetrics, NoopMetrics, SynthesisMetrics};
pub use quota::QuotaManager;
pub use rate_limit::RateLimiter;
pub use safety::{CodeSafetyValidator, Violation};

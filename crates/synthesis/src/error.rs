//! Error types shared by every synthesis governance component.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::safety::Violation;

/// Which daily budget a namespace ran out of.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuotaViolation {
    #[error(
        "synthesis cost quota exceeded for namespace {namespace}: current {current:.4} + estimated {estimated:.4} = {projected:.4} > limit {limit:.4} {currency} (resets at {})",
        reset_at.to_rfc3339()
    )]
    Cost {
        namespace: String,
        current: f64,
        estimated: f64,
        projected: f64,
        limit: f64,
        currency: String,
        reset_at: DateTime<Utc>,
    },

    #[error(
        "synthesis attempt quota exceeded for namespace {namespace}: {attempts} attempts today, limit is {limit} (resets at {})",
        reset_at.to_rfc3339()
    )]
    Attempts {
        namespace: String,
        attempts: u32,
        limit: u32,
        reset_at: DateTime<Utc>,
    },
}

impl QuotaViolation {
    /// Metric label for the exhausted budget.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cost { .. } => "cost",
            Self::Attempts { .. } => "attempts",
        }
    }

    /// When the exhausted window rolls over.
    #[must_use]
    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Self::Cost { reset_at, .. } | Self::Attempts { reset_at, .. } => *reset_at,
        }
    }
}

/// Errors produced by admission control, quota accounting, artifact storage
/// and guarded process execution.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error(
        "synthesis rate limit exceeded for namespace {namespace}: {limit} per hour (retry in {:.0} seconds)",
        retry_after.as_secs_f64()
    )]
    AdmissionDenied {
        namespace: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaViolation),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "artifact {name} is {actual_size} bytes, exceeding the {max_size} byte limit (compressed: {compressed}, original size: {original_size})"
    )]
    SizeExceeded {
        name: String,
        actual_size: usize,
        max_size: usize,
        compressed: bool,
        original_size: usize,
    },

    #[error("script integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("command not allowed: {command} (not in security allowlist)")]
    NotAllowlisted { command: String },

    #[error("command contains invalid characters: {command}")]
    InvalidCommandCharacters { command: String },

    #[error("argument {index} contains invalid characters: {argument}")]
    InvalidArgumentCharacters { index: usize, argument: String },

    #[error("no valid script found in allowed paths: {}", searched.join(", "))]
    ScriptNotFound { searched: Vec<String> },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("command timed out after {}s: {command}", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    #[error("command failed with exit code {exit_code:?}: {command} (stderr: {stderr})")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("generated code failed safety validation with {} violation(s)", .0.len())]
    SafetyViolations(Vec<Violation>),

    #[error("code generation failed: {0}")]
    Generation(String),

    #[error("Artifact backend error: {0}")]
    Backend(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SynthesisError {
    /// Admission and quota denials clear on their own once the window moves;
    /// everything else needs a change before a retry can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AdmissionDenied { .. } | Self::QuotaExceeded(_))
    }

    /// True for a missing record or script.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SynthesisError {
    fn from(err: serde_json::Error) -> Self {
        SynthesisError::Encoding(err.to_string())
    }
}

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, SynthesisError>;

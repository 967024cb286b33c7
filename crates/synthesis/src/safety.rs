//! Pluggable safety validation for generated agent code.
//!
//! The bundled [`SchemaScriptValidator`] feeds code to a pinned Ruby schema
//! script through the [`CommandGuard`] and turns its JSON report into
//! [`Violation`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::{Result, SynthesisError};
use crate::guard::{CommandGuard, ScriptIntegrity};

/// One problem found in generated code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Line number, 0 when unknown
    #[serde(default)]
    pub location: u32,
    pub message: String,
}

/// Checks generated code before it is stored
#[async_trait]
pub trait CodeSafetyValidator: Send + Sync {
    /// Empty when the code is acceptable. `Err` means validation itself failed.
    async fn validate(&self, code: &str) -> Result<Vec<Violation>>;
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

#[async_trait]
impl CodeSafetyValidator for NoopValidator {
    async fn validate(&self, _code: &str) -> Result<Vec<Violation>> {
        Ok(Vec::new())
    }
}

/// Runs `bundle exec ruby <script>` with the code on stdin
pub struct SchemaScriptValidator {
    guard: CommandGuard,
    integrity: ScriptIntegrity,
    timeout: Duration,
    required: bool,
}

impl SchemaScriptValidator {
    #[must_use]
    pub fn new(guard: CommandGuard, integrity: ScriptIntegrity, timeout: Duration) -> Self {
        Self {
            guard,
            integrity,
            timeout,
            required: false,
        }
    }

    #[must_use]
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            guard: CommandGuard::new(),
            integrity: ScriptIntegrity::from_config(config),
            timeout: config.command_timeout(),
            required: config.require_safety_validation,
        }
    }

    /// Fail instead of skipping when the toolchain or script is missing.
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    fn parse_report(output: &str) -> Result<Vec<Violation>> {
        let output = output.trim();
        if output.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(output).map_err(|e| {
            SynthesisError::Encoding(format!(
                "schema validator produced invalid output: {output} ({e})"
            ))
        })
    }

    fn skip(&self, reason: &str) -> Result<Vec<Violation>> {
        if self.required {
            return Err(SynthesisError::Config(format!(
                "safety validation is required but {reason}"
            )));
        }
        info!(reason, "Skipping schema validation");
        Ok(Vec::new())
    }
}

#[async_trait]
impl CodeSafetyValidator for SchemaScriptValidator {
    async fn validate(&self, code: &str) -> Result<Vec<Violation>> {
        // A tampered script fails here whether or not ruby is installed.
        let script = match self.integrity.discover() {
            Ok(script) => script,
            Err(SynthesisError::ScriptNotFound { .. }) => {
                return self.skip("the validator script was not found");
            }
            Err(e) => return Err(e),
        };
        let script = script.to_string_lossy().into_owned();

        for program in ["ruby", "bundle"] {
            if which::which(program).is_err() {
                return self.skip(&format!("{program} is not installed"));
            }
        }

        match self
            .guard
            .execute(
                "bundle",
                &["exec", "ruby", script.as_str()],
                Some(code),
                self.timeout,
            )
            .await
        {
            Ok(output) => {
                let violations = Self::parse_report(&output.stdout)?;
                debug!(violations = violations.len(), "Schema validation finished");
                Ok(violations)
            }
            // Exit status 1 with a report means the code has violations.
            Err(SynthesisError::CommandFailed {
                exit_code: Some(1),
                stdout,
                ..
            }) if !stdout.trim().is_empty() => {
                let violations = Self::parse_report(&stdout)?;
                warn!(violations = violations.len(), "Generated code failed schema validation");
                Ok(violations)
            }
            Err(e) => Err(e),
        }
    }
}

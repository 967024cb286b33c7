//! # Guarded Process Execution
//!
//! Every external process the synthesis pipeline starts goes through
//! [`CommandGuard`]: the program must be on a fixed allowlist, neither the
//! program nor its arguments may contain shell metacharacters, and the process
//! is killed when its deadline passes.

pub mod integrity;

pub use integrity::ScriptIntegrity;

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SynthesisError};

/// Programs the pipeline may run
pub const ALLOWED_COMMANDS: &[&str] = &["aictl", "bundle", "ruby"];

const FORBIDDEN_IN_COMMAND: &[char] = &[
    '$', '`', ';', '&', '|', '>', '<', '*', '?', '[', ']', '{', '}', '(', ')', '~',
];

// Brackets are allowed in arguments.
const FORBIDDEN_IN_ARGUMENT: &[char] = &[
    '$', '`', ';', '&', '|', '>', '<', '*', '?', '{', '}', '(', ')', '~',
];

/// Captured output of a successful process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Allowlist and character-class gate in front of `tokio::process`
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed: HashSet<String>,
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allowed: ALLOWED_COMMANDS.iter().map(ToString::to_string).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn allowing(commands: &[&str]) -> Self {
        Self {
            allowed: commands.iter().map(ToString::to_string).collect(),
        }
    }

    /// Check `command` and `args` without running anything.
    pub fn validate(&self, command: &str, args: &[&str]) -> Result<()> {
        if !self.allowed.contains(command) {
            warn!(command, "Blocked command outside the allowlist");
            return Err(SynthesisError::NotAllowlisted {
                command: command.to_string(),
            });
        }

        if command.contains(FORBIDDEN_IN_COMMAND) {
            return Err(SynthesisError::InvalidCommandCharacters {
                command: command.to_string(),
            });
        }

        for (index, argument) in args.iter().enumerate() {
            if argument.contains(FORBIDDEN_IN_ARGUMENT) {
                warn!(command, index, "Blocked argument with shell metacharacters");
                return Err(SynthesisError::InvalidArgumentCharacters {
                    index,
                    argument: (*argument).to_string(),
                });
            }
        }

        Ok(())
    }

    /// Validate, then run the process with an optional stdin payload.
    ///
    /// A process still running at `timeout` is killed and reported as
    /// [`SynthesisError::Timeout`]. A non-zero exit is
    /// [`SynthesisError::CommandFailed`] and carries both output streams.
    pub async fn execute(
        &self,
        command: &str,
        args: &[&str],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.validate(command, args)?;

        let rendered = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let mut child = Command::new(command)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_string();
            // Written from a separate task so a child that fills its stdout
            // before draining stdin cannot stall us.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %rendered, timeout_secs = timeout.as_secs_f64(), "Command timed out");
                return Err(SynthesisError::Timeout {
                    command: rendered,
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            debug!(command = %rendered, exit_code = ?output.status.code(), "Command failed");
            return Err(SynthesisError::CommandFailed {
                command: rendered,
                exit_code: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_is_not_allowlisted() {
        let guard = CommandGuard::new();
        let err = guard.validate("sh", &["-c", "echo hi"]).unwrap_err();
        assert!(matches!(err, SynthesisError::NotAllowlisted { ref command } if command == "sh"));
    }

    #[test]
    fn test_command_substitution_in_argument_rejected() {
        let guard = CommandGuard::new();
        let err = guard.validate("ruby", &["$(rm -rf /)"]).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::InvalidArgumentCharacters { index: 0, .. }
        ));
    }

    #[test]
    fn test_plain_invocations_allowed() {
        let guard = CommandGuard::new();
        assert!(guard.validate("ruby", &[]).is_ok());
        assert!(guard
            .validate("bundle", &["exec", "ruby", "/usr/local/bin/validate-dsl-schema.rb"])
            .is_ok());
        assert!(guard.validate("aictl", &["system", "schema", "--version"]).is_ok());
    }

    #[test]
    fn test_brackets_only_forbidden_in_command() {
        let guard = CommandGuard::allowing(&["ruby", "ruby[1]"]);
        assert!(guard.validate("ruby", &["items[0]"]).is_ok());
        assert!(matches!(
            guard.validate("ruby[1]", &[]),
            Err(SynthesisError::InvalidCommandCharacters { .. })
        ));
    }

    #[test]
    fn test_every_metacharacter_rejected_in_arguments() {
        let guard = CommandGuard::new();
        for ch in FORBIDDEN_IN_ARGUMENT {
            let argument = format!("safe{ch}");
            let err = guard.validate("ruby", &["ok", argument.as_str()]).unwrap_err();
            assert!(matches!(
                err,
                SynthesisError::InvalidArgumentCharacters { index: 1, .. }
            ));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_pipes_stdin() {
        let guard = CommandGuard::allowing(&["cat"]);
        let output = guard
            .execute("cat", &[], Some("agent 'x' do\nend\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "agent 'x' do\nend\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_times_out() {
        let guard = CommandGuard::allowing(&["sleep"]);
        let err = guard
            .execute("sleep", &["5"], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let guard = CommandGuard::allowing(&["false"]);
        let err = guard
            .execute("false", &[], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::CommandFailed {
                exit_code: Some(1),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_execute_validates_before_spawning() {
        let guard = CommandGuard::new();
        let err = guard
            .execute("rm", &["-rf", "/"], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::NotAllowlisted { .. }));
    }
}

//! SHA-256 pinning for helper scripts run by the guard.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::error::{Result, SynthesisError};

/// A pinned digest plus the places the script may live
#[derive(Debug, Clone)]
pub struct ScriptIntegrity {
    expected_sha256: String,
    candidates: Vec<PathBuf>,
}

impl ScriptIntegrity {
    #[must_use]
    pub fn new(expected_sha256: impl Into<String>, candidates: Vec<PathBuf>) -> Self {
        Self {
            expected_sha256: expected_sha256.into().to_ascii_lowercase(),
            candidates,
        }
    }

    #[must_use]
    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(
            config.validator_script_sha256.clone(),
            config.validator_script_paths.clone(),
        )
    }

    /// Fail with `Integrity` unless the file at `path` hashes to the pinned digest.
    pub fn verify(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read(path)?;
        let actual = hex::encode(Sha256::digest(&contents));

        if actual != self.expected_sha256 {
            warn!(
                path = %path.display(),
                expected = %self.expected_sha256,
                actual = %actual,
                "Script integrity check failed"
            );
            return Err(SynthesisError::Integrity {
                path: path.display().to_string(),
                expected: self.expected_sha256.clone(),
                actual,
            });
        }

        Ok(())
    }

    /// First candidate that exists, verified. A present but tampered script
    /// is an error; later candidates are not consulted.
    pub fn discover(&self) -> Result<PathBuf> {
        for candidate in &self.candidates {
            let path = if candidate.is_absolute() {
                candidate.clone()
            } else {
                std::env::current_dir()?.join(candidate)
            };

            if !path.is_file() {
                continue;
            }

            self.verify(&path)?;
            debug!(path = %path.display(), "Located verified script");
            return Ok(path);
        }

        Err(SynthesisError::ScriptNotFound {
            searched: self
                .candidates
                .iter()
                .map(|candidate| candidate.display().to_string())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCRIPT: &[u8] = b"require 'json'\nputs [].to_json\n";

    fn script_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn digest(contents: &[u8]) -> String {
        hex::encode(Sha256::digest(contents))
    }

    #[test]
    fn matching_script_verifies() {
        let file = script_file(SCRIPT);
        let integrity = ScriptIntegrity::new(digest(SCRIPT), vec![file.path().to_path_buf()]);

        assert!(integrity.verify(file.path()).is_ok());
        assert_eq!(integrity.discover().unwrap(), file.path());
    }

    #[test]
    fn uppercase_pinned_digest_is_accepted() {
        let file = script_file(SCRIPT);
        let integrity = ScriptIntegrity::new(digest(SCRIPT).to_uppercase(), vec![]);
        assert!(integrity.verify(file.path()).is_ok());
    }

    #[test]
    fn tampered_script_is_rejected() {
        let file = script_file(b"system('rm -rf /')\n");
        let integrity = ScriptIntegrity::new(digest(SCRIPT), vec![file.path().to_path_buf()]);

        let err = integrity.discover().unwrap_err();
        match err {
            SynthesisError::Integrity { expected, actual, .. } => {
                assert_eq!(expected, digest(SCRIPT));
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_candidates_are_skipped() {
        let file = script_file(SCRIPT);
        let integrity = ScriptIntegrity::new(
            digest(SCRIPT),
            vec![
                PathBuf::from("/nonexistent/validate-dsl-schema.rb"),
                file.path().to_path_buf(),
            ],
        );

        assert_eq!(integrity.discover().unwrap(), file.path());
    }

    #[test]
    fn nothing_found_is_distinct_from_tampering() {
        let integrity = ScriptIntegrity::new(
            digest(SCRIPT),
            vec![PathBuf::from("/nonexistent/validate-dsl-schema.rb")],
        );

        let err = integrity.discover().unwrap_err();
        assert!(matches!(err, SynthesisError::ScriptNotFound { ref searched } if searched.len() == 1));
    }
}

//! Retention sweep - deletes old agent code versions.
//!
//! Runs inside the CronJob installed by `ArtifactStore::schedule_retention_sweep`.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use synthesis::artifact::{ArtifactOwner, ArtifactStore, KubeArtifactBackend, RetentionPolicy};
use synthesis::config::ArtifactConfig;
use synthesis::telemetry;

#[derive(Parser, Debug)]
#[command(name = "retention-sweep")]
#[command(about = "Apply a retention policy to an agent's versioned code")]
#[command(version)]
struct Cli {
    /// Agent whose versions are swept
    #[arg(long)]
    agent: String,

    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Newest versions to keep (0 keeps all)
    #[arg(long, default_value_t = 0)]
    keep_last: u32,

    /// Delete versions older than this many days (0 never expires)
    #[arg(long, default_value_t = 0)]
    cleanup_after_days: u32,

    /// Never delete version 1
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    always_keep_initial: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON logs
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

impl Cli {
    fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last_n: self.keep_last,
            cleanup_after_days: self.cleanup_after_days,
            always_keep_initial: self.always_keep_initial,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose, cli.json_logs);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let store = ArtifactStore::new(
        Arc::new(KubeArtifactBackend::new(client)),
        &ArtifactConfig::default(),
    );
    let owner = ArtifactOwner::new(&cli.agent, &cli.namespace);
    let policy = cli.policy();

    info!(
        agent = %cli.agent,
        namespace = %cli.namespace,
        keep_last = policy.keep_last_n,
        cleanup_after_days = policy.cleanup_after_days,
        always_keep_initial = policy.always_keep_initial,
        "Starting retention sweep"
    );

    let report = store
        .apply_retention_policy(&owner, Some(&policy))
        .await
        .with_context(|| format!("Failed to sweep versions of {}", cli.agent))?;

    info!(
        total = report.total,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Retention sweep finished"
    );

    if !report.failed.is_empty() {
        anyhow::bail!(
            "{} version(s) could not be deleted: {:?}",
            report.failed.len(),
            report.failed
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cronjob_arguments() {
        let cli = Cli::try_parse_from([
            "retention-sweep",
            "--agent",
            "weather-agent",
            "--namespace",
            "demo",
            "--keep-last",
            "5",
            "--cleanup-after-days",
            "30",
            "--always-keep-initial=true",
        ])
        .unwrap();

        let policy = cli.policy();
        assert_eq!(policy.keep_last_n, 5);
        assert_eq!(policy.cleanup_after_days, 30);
        assert!(policy.always_keep_initial);
    }

    #[test]
    fn always_keep_initial_defaults_off() {
        let cli = Cli::try_parse_from([
            "retention-sweep",
            "--agent",
            "a",
            "--namespace",
            "ns",
            "--always-keep-initial=false",
        ])
        .unwrap();
        assert!(!cli.always_keep_initial);
        assert_eq!(cli.keep_last, 0);
    }
}

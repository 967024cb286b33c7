//! Retention policy for versioned artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ArtifactVersion;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs at the top of every hour
pub const HOURLY_SCHEDULE: &str = "0 * * * *";
/// Runs daily at 03:00
pub const DAILY_SCHEDULE: &str = "0 3 * * *";

/// Which versions of an agent's code to keep
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Newest versions to keep; 0 keeps all
    #[serde(default)]
    pub keep_last_n: u32,

    /// Delete versions older than this many days; 0 never expires
    #[serde(default)]
    pub cleanup_after_days: u32,

    /// Never delete version 1
    #[serde(default)]
    pub always_keep_initial: bool,

    /// How often the scheduled sweep runs; zero disables it
    #[serde(
        default,
        rename = "cleanupIntervalSeconds",
        with = "duration_secs"
    )]
    pub cleanup_interval: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl RetentionPolicy {
    /// Cron expression for the scheduled sweep, `None` when disabled.
    #[must_use]
    pub fn cron_schedule(&self) -> Option<&'static str> {
        if self.cleanup_interval.is_zero() {
            None
        } else if self.cleanup_interval < DAY {
            Some(HOURLY_SCHEDULE)
        } else {
            Some(DAILY_SCHEDULE)
        }
    }

    fn should_delete(&self, rank: usize, version: &ArtifactVersion, now: DateTime<Utc>) -> bool {
        if self.always_keep_initial && version.version == 1 {
            return false;
        }

        let beyond_keep = self.keep_last_n > 0 && rank >= self.keep_last_n as usize;
        let expired = self.cleanup_after_days > 0
            && (now - version.created_at).num_days() > i64::from(self.cleanup_after_days);

        beyond_keep || expired
    }

    /// Versions to delete, newest first.
    #[must_use]
    pub fn select_for_deletion<'a>(
        &self,
        versions: &'a [ArtifactVersion],
        now: DateTime<Utc>,
    ) -> Vec<&'a ArtifactVersion> {
        let mut ranked: Vec<&ArtifactVersion> = versions.iter().collect();
        ranked.sort_by(|a, b| b.version.cmp(&a.version));

        ranked
            .into_iter()
            .enumerate()
            .filter(|(rank, version)| self.should_delete(*rank, version, now))
            .map(|(_, version)| version)
            .collect()
    }
}

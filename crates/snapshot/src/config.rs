//! `[snapshot]` table of `waypoint.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SnapshotError, SnapshotResult};

/// Snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    /// When false, `track` is a no-op for every project.
    pub enabled: bool,
    /// Shadow repositories live under `<data_dir>/snapshot/<project id>`.
    pub data_dir: PathBuf,
    /// Change sets at least this large are staged through stdin instead of argv.
    pub bulk_add_threshold: usize,
    pub gc: GcConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("waypoint"),
            bulk_add_threshold: 64,
            gc: GcConfig::default(),
        }
    }
}

impl SnapshotConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load the `[snapshot]` table, falling back to defaults when absent.
    pub fn load(path: &Path) -> SnapshotResult<Self> {
        waypoint_utils::load_section(path, "snapshot").map_err(|e| {
            SnapshotError::Config(format!("Failed to load snapshot config: {}", e))
        })
    }

    pub fn shadow_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("snapshot").join(project_id)
    }
}

/// Garbage collection windows for shadow repositories.
///
/// Prune windows are passed verbatim to `git gc --prune=<window>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Period of the scheduled cleanup job.
    pub cleanup_interval_secs: u64,
    pub prune: String,
    /// Minimum time between two GC runs triggered from `track`.
    pub inline_interval_secs: u64,
    pub inline_prune: String,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60 * 60,
            prune: "7.days".to_string(),
            inline_interval_secs: 30 * 60,
            inline_prune: "1.day".to_string(),
        }
    }
}

impl GcConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn inline_interval(&self) -> Duration {
        Duration::from_secs(self.inline_interval_secs)
    }
}

//! `[storage]` table of `waypoint.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root of the JSON document tree and the `migration` cursor file.
    pub data_dir: PathBuf,
    /// SQLite database file. Defaults to `<data_dir>/waypoint.db`.
    pub database: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("waypoint")
            .join("storage");
        Self {
            data_dir,
            database: None,
        }
    }
}

impl StorageConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database: None,
        }
    }

    /// Load the `[storage]` table, falling back to defaults when absent.
    pub fn load(path: &Path) -> StorageResult<Self> {
        waypoint_utils::load_section(path, "storage")
            .map_err(|e| StorageError::Other(format!("Failed to load storage config: {}", e)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("waypoint.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_defaults_into_data_dir() {
        let config = StorageConfig::with_data_dir("/tmp/wp");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/wp/waypoint.db"));
    }

    #[test]
    fn parses_storage_table() {
        let config: StorageConfig = waypoint_utils::parse_section(
            "[storage]\ndata_dir = \"/srv/wp\"\ndatabase = \"/srv/db.sqlite\"\n",
            "storage",
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/wp"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/db.sqlite"));
    }
}

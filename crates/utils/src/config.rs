//! TOML configuration file support.
//!
//! A single `waypoint.toml` carries one table per component:
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/waypoint/storage"
//!
//! [snapshot]
//! enabled = false
//! ```
//!
//! Each crate owns the type of its own table and loads it with [`load_section`].

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a configuration section.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid [{section}] table: {source}")]
    Section {
        section: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Deserialize the `[section]` table of the file at `path`.
///
/// A missing file or a missing table yields `T::default()`.
pub fn load_section<T>(path: &Path, section: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    parse_section(&content, section).map_err(|err| match err {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Deserialize the `[section]` table of an in-memory TOML document.
pub fn parse_section<T>(content: &str, section: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let mut document: toml::Table = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: PathBuf::new(),
        source,
    })?;

    match document.remove(section) {
        Some(value) => value.try_into().map_err(|source| ConfigError::Section {
            section: section.to_string(),
            source,
        }),
        None => Ok(T::default()),
    }
}

//! Shared plumbing for the waypoint crates: log setup and TOML config sections.

pub mod config;
pub mod telemetry;

pub use config::{ConfigError, load_section, parse_section};
pub use telemetry::setup_logging;

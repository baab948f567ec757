//! Process-wide logging: `log` records bridged into a `tracing` subscriber.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Install the process-wide log subscriber.
///
/// # Behavior
/// - `log` records emitted by the storage and snapshot crates are bridged into
///   `tracing` through [`LogTracer`].
/// - Filtering follows `RUST_LOG`; when unset, `info` is used.
/// - `WAYPOINT_LOG_ANSI=0` disables colored output (useful when logs go to a file).
///
/// Returns `false` when a subscriber was already installed, either by an earlier
/// call or by the embedding application.
pub fn setup_logging(service_name: &str) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    if LogTracer::init().is_err() {
        return false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let ansi = std::env::var("WAYPOINT_LOG_ANSI")
        .map(|v| v != "0")
        .unwrap_or(true);
    let fmt_layer = fmt::layer().with_target(true).with_ansi(ansi);

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }

    log::info!("{} logging initialized", service_name);
    true
}

//! Structured Logger
//!
//! Console output and a rolling NDJSON file follow `RUST_LOG` (or the
//! level handed in). Plugin lifecycle records always go to their own NDJSON
//! file, whatever the level, so a host keeps an audit trail of every
//! load and unload.

use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::event_logger::LIFECYCLE_TARGET;

/// File name prefix of the general log.
pub const GENERAL_LOG: &str = "perch.log";
/// File name prefix of the lifecycle log.
pub const LIFECYCLE_LOG: &str = "lifecycle.log";

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Build the subscriber without installing it, for hosts and tests that
/// scope it with `tracing::subscriber::set_default`.
pub fn build_subscriber(log_dir: &Path, level: &str) -> impl Subscriber + Send + Sync + use<> {
    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_ansi(true)
        .with_filter(level_filter(level));

    let general_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, GENERAL_LOG))
        .with_ansi(false)
        .with_filter(level_filter(level));

    let lifecycle_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, LIFECYCLE_LOG))
        .with_ansi(false)
        .with_filter(Targets::new().with_target(LIFECYCLE_TARGET, Level::INFO));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(general_layer)
        .with(lifecycle_layer)
}

/// Install the subscriber globally. A second call keeps the first one.
pub fn init_logger<P: AsRef<Path>>(log_dir: P, level: &str) {
    let _ = build_subscriber(log_dir.as_ref(), level).try_init();
}

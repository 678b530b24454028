//! Structured logging for Perch.
//!
//! Console + rolling NDJSON file output, plugin lifecycle records, and the
//! tree renderer used for debug dumps of plugin data.

pub mod event_logger;
pub mod logger;
pub mod tree;

pub use event_logger::{LIFECYCLE_TARGET, LifecycleEvent, LifecycleLogEntry, LifecycleLogger};
pub use logger::{GENERAL_LOG, LIFECYCLE_LOG, build_subscriber, init_logger};
pub use tree::{render_dump, render_tree};

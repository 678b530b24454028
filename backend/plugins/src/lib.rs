//! `perch-plugins`: plugin lifecycle and resource coordination.
//!
//! Provides:
//! - `PluginLifecycle`: construction, load and unload sequences for one plugin
//! - Event bus contract and a priority-ordered in-process bus
//! - Per-plugin handler tracking with bulk revocation on unload
//! - Validated scheduled-task registration
//! - File-backed persistent data and a scoped working directory
//! - `PluginRegistry`: dependency-ordered loading of many plugins

pub mod config;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod manifest;
pub mod paths;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod workspace;

pub use config::PluginConfig;
pub use error::{PluginError, Result};
pub use event_bus::{Event, EventBus, EventHandler, HandlerId, HandlerOutcome, PriorityEventBus};
pub use lifecycle::{CloseArgs, Plugin, PluginContext, PluginLifecycle, PluginState};
pub use manifest::PluginIdentity;
pub use paths::PluginPaths;
pub use registry::{LoadReport, ManagedPlugin, PluginRegistry};
pub use scheduler::{
    Interval, JobTable, JobTick, ScheduledJob, ScheduledTaskFacade, Scheduler, TaskSpec,
};
pub use store::{PersistentStore, StoreError, StoreFormat};
pub use subscriptions::{EventSubscriptionRegistry, HandlerRegistration};
pub use workspace::{WorkspaceGuard, WorkspaceScope};

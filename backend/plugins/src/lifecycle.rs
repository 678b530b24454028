//! Plugin lifecycle: construction, the load sequence and the unload sequence.
//!
//! A concrete plugin implements [`Plugin`]; [`PluginLifecycle`] wraps it and
//! owns everything the plugin is wired to. Plugin code reaches the shared
//! infrastructure through the [`PluginContext`] handed to every hook.
//!
//! Hooks come in two kinds:
//! - blocking (`init`, `close`): run on tokio's blocking pool and awaited;
//! - async (`on_load`, `on_close`): spawned on the runtime and awaited.
//!
//! A hook that panics leaves the plugin `Failed` with its handlers revoked
//! before the panic reaches the caller.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use perch_logging::{render_dump, LifecycleEvent, LifecycleLogger};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PluginConfig;
use crate::error::{PluginError, Result};
use crate::event_bus::{Event, EventBus, EventHandler, HandlerId, HandlerOutcome};
use crate::manifest::PluginIdentity;
use crate::paths::PluginPaths;
use crate::scheduler::{ScheduledTaskFacade, Scheduler, TaskSpec};
use crate::store::PersistentStore;
use crate::subscriptions::EventSubscriptionRegistry;
use crate::workspace::WorkspaceScope;

/// Current state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Active,
    Unloading,
    Failed,
}

/// Arguments the host forwards to both close hooks.
#[derive(Debug, Clone, Default)]
pub struct CloseArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CloseArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }
}

/// Capability interface implemented by plugins. Every hook defaults to a no-op.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn identity(&self) -> PluginIdentity;

    /// Blocking initialisation, run off the async runtime before `on_load`.
    fn init(&self, _ctx: &PluginContext) -> AnyResult<()> {
        Ok(())
    }

    async fn on_load(&self, _ctx: &PluginContext) -> AnyResult<()> {
        Ok(())
    }

    /// Blocking cleanup, run off the async runtime before `on_close`.
    fn close(&self, _ctx: &PluginContext, _args: &CloseArgs) -> AnyResult<()> {
        Ok(())
    }

    async fn on_close(&self, _ctx: &PluginContext, _args: &CloseArgs) -> AnyResult<()> {
        Ok(())
    }
}

/// Everything a plugin instance is bound to.
pub struct PluginContext {
    identity: PluginIdentity,
    save_type: String,
    paths: PluginPaths,
    first_load: bool,
    debug: bool,
    lock: Mutex<()>,
    store: RwLock<PersistentStore>,
    workspace: WorkspaceScope,
    subscriptions: EventSubscriptionRegistry,
    tasks: ScheduledTaskFacade,
}

impl PluginContext {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn version(&self) -> &str {
        &self.identity.version
    }

    pub fn dependencies(&self) -> &BTreeMap<String, String> {
        &self.identity.dependencies
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn save_type(&self) -> &str {
        &self.save_type
    }

    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    /// True if no persisted state existed when the plugin was constructed.
    pub fn first_load(&self) -> bool {
        self.first_load
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Per-instance lock for plugin code. The lifecycle never takes it.
    pub fn lock(&self) -> &Mutex<()> {
        &self.lock
    }

    pub fn workspace(&self) -> &WorkspaceScope {
        &self.workspace
    }

    pub async fn data(&self) -> RwLockReadGuard<'_, Value> {
        RwLockReadGuard::map(self.store.read().await, PersistentStore::data)
    }

    pub async fn data_mut(&self) -> RwLockMappedWriteGuard<'_, Value> {
        RwLockWriteGuard::map(self.store.write().await, PersistentStore::data_mut)
    }

    /// Data access for blocking hooks. Panics if called from async code.
    pub fn blocking_data(&self) -> RwLockReadGuard<'_, Value> {
        RwLockReadGuard::map(self.store.blocking_read(), PersistentStore::data)
    }

    /// Mutable data access for blocking hooks. Panics if called from async code.
    pub fn blocking_data_mut(&self) -> RwLockMappedWriteGuard<'_, Value> {
        RwLockWriteGuard::map(self.store.blocking_write(), PersistentStore::data_mut)
    }

    /// The tree a debug-mode unload prints instead of saving.
    pub async fn debug_dump(&self) -> String {
        render_dump(self.name(), &*self.data().await)
    }

    pub fn register_handler<F>(&self, event_type: &str, handler: F, priority: i32) -> HandlerId
    where
        F: Fn(&Event) -> HandlerOutcome + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.subscriptions.register(event_type, handler, priority)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.subscriptions.unregister(id)
    }

    pub fn unregister_handlers(&self) {
        self.subscriptions.unregister_all();
    }

    pub fn active_handlers(&self) -> usize {
        self.subscriptions.active_count()
    }

    pub fn handler_ids(&self) -> Vec<HandlerId> {
        self.subscriptions.ids()
    }

    pub fn publish_sync(&self, event: &Event) -> Vec<HandlerOutcome> {
        self.subscriptions.bus().publish_sync(event)
    }

    pub async fn publish_async(&self, event: Event) -> Vec<HandlerOutcome> {
        self.subscriptions.bus().publish_async(event).await
    }

    pub fn add_scheduled_task(&self, spec: TaskSpec) -> Result<bool> {
        self.tasks.add(spec)
    }

    pub fn remove_scheduled_task(&self, name: &str) -> bool {
        self.tasks.remove(name)
    }
}

/// Owns one plugin and drives it through its lifecycle.
pub struct PluginLifecycle<P: Plugin> {
    plugin: Arc<P>,
    ctx: Arc<PluginContext>,
    seed: Option<Map<String, Value>>,
    state: PluginState,
    /// Set by a successful onload, cleared once unload has saved.
    loaded: bool,
}

impl<P: Plugin> PluginLifecycle<P> {
    /// Validate the plugin's identity, resolve its paths and wire it to the
    /// bus and scheduler. May create the work dir; never runs plugin hooks.
    pub fn new(
        plugin: P,
        bus: Arc<dyn EventBus>,
        scheduler: Arc<dyn Scheduler>,
        mut config: PluginConfig,
    ) -> Result<Self> {
        let mut identity = plugin.identity();
        identity.validate()?;

        if let Some(dependencies) = config.dependencies.take() {
            identity.dependencies = dependencies;
        }
        let save_type = config.save_type().to_string();
        let name = identity.name.clone();

        let paths = PluginPaths::resolve(&name, &config)?;
        let first_load = paths.prepare(&name)?;

        let ctx = PluginContext {
            store: RwLock::new(PersistentStore::new(&paths.data_file)),
            workspace: WorkspaceScope::new(&paths.work_dir),
            subscriptions: EventSubscriptionRegistry::new(&name, bus),
            tasks: ScheduledTaskFacade::new(&name, scheduler),
            lock: Mutex::new(()),
            identity,
            save_type,
            paths,
            first_load,
            debug: config.debug,
        };
        LifecycleLogger::log_event(&name, LifecycleEvent::Constructed { first_load });

        Ok(Self {
            plugin: Arc::new(plugin),
            ctx: Arc::new(ctx),
            seed: config.data.take(),
            state: PluginState::Unloaded,
            loaded: false,
        })
    }

    pub fn plugin(&self) -> &Arc<P> {
        &self.plugin
    }

    pub fn context(&self) -> &Arc<PluginContext> {
        &self.ctx
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    fn invalid_state(&self, expected: &'static str) -> PluginError {
        PluginError::InvalidState {
            plugin: self.ctx.name().to_string(),
            state: self.state,
            expected,
        }
    }

    /// Load persisted data, then run `init` and `on_load`. Call once.
    pub async fn onload(&mut self) -> Result<()> {
        if self.state != PluginState::Unloaded {
            return Err(self.invalid_state("unloaded"));
        }
        self.state = PluginState::Loading;
        debug!(plugin = %self.ctx.name(), "Running load sequence");

        match self.run_load_sequence().await {
            Ok(()) => {
                self.state = PluginState::Active;
                self.loaded = true;
                info!(plugin = %self.ctx.name(), version = %self.ctx.version(), "Plugin loaded");
                LifecycleLogger::log_event(self.ctx.name(), LifecycleEvent::Loaded);
                Ok(())
            }
            Err(Interrupted::Error(e)) => {
                self.state = PluginState::Failed;
                error!(plugin = %self.ctx.name(), error = %e, "Plugin failed to load");
                LifecycleLogger::log_event(
                    self.ctx.name(),
                    LifecycleEvent::LoadFailed { error: e.to_string() },
                );
                Err(e)
            }
            Err(Interrupted::Panic(payload)) => {
                self.ctx.unregister_handlers();
                self.fail_on_panic(payload, |error| LifecycleEvent::LoadFailed { error })
            }
        }
    }

    async fn run_load_sequence(&mut self) -> Result<(), Interrupted> {
        self.load_data().await?;

        let plugin = Arc::clone(&self.plugin);
        let ctx = Arc::clone(&self.ctx);
        join_hook(tokio::task::spawn_blocking(move || plugin.init(&ctx))).await?;

        let plugin = Arc::clone(&self.plugin);
        let ctx = Arc::clone(&self.ctx);
        join_hook(tokio::spawn(async move { plugin.on_load(&ctx).await })).await
    }

    /// Load the data file, resetting it once if it is missing or unreadable.
    async fn load_data(&mut self) -> Result<()> {
        let name = self.ctx.name();
        let mut store = self.ctx.store.write().await;
        if let Some(seed) = self.seed.take() {
            store.adopt(seed);
        }

        match store.load().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(plugin = %name, error = %e, "Persistent data unreadable, resetting");
                store
                    .reset()
                    .await
                    .map_err(|e| PluginError::persistence(name, "resetting", &e))?;
                LifecycleLogger::log_event(name, LifecycleEvent::DataReset);
                store
                    .load()
                    .await
                    .map_err(|e| PluginError::persistence(name, "loading", &e))
            }
            Err(e) => Err(PluginError::persistence(name, "loading", &e)),
        }
    }

    /// Revoke handlers, run `close` and `on_close`, then save the data.
    ///
    /// Whatever the outcome, no handler registered through this plugin stays
    /// subscribed once this returns or unwinds. Data is saved only if it was
    /// loaded by a successful onload and not yet written by an earlier unload.
    pub async fn unload(&mut self, args: CloseArgs) -> Result<()> {
        if !matches!(self.state, PluginState::Active | PluginState::Failed) {
            return Err(self.invalid_state("active or failed"));
        }
        self.state = PluginState::Unloading;
        debug!(plugin = %self.ctx.name(), "Running unload sequence");

        self.ctx.unregister_handlers();
        let hooks = self.run_close_hooks(args).await;
        // Close hooks may have registered handlers of their own.
        self.ctx.unregister_handlers();

        let hooks = match hooks {
            Ok(()) => Ok(()),
            Err(Interrupted::Error(e)) => Err(e),
            Err(Interrupted::Panic(payload)) => {
                self.fail_on_panic(payload, |error| LifecycleEvent::UnloadFailed { error })
            }
        };
        let result = match hooks {
            Ok(()) if self.loaded => self.persist().await,
            Ok(()) => {
                warn!(plugin = %self.ctx.name(), "Plugin never loaded, not saving its data");
                Ok(())
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.state = PluginState::Unloaded;
                self.loaded = false;
                info!(plugin = %self.ctx.name(), "Plugin unloaded");
                LifecycleLogger::log_event(self.ctx.name(), LifecycleEvent::Unloaded);
            }
            Err(e) => {
                self.state = PluginState::Failed;
                error!(plugin = %self.ctx.name(), error = %e, "Plugin unload failed");
                LifecycleLogger::log_event(
                    self.ctx.name(),
                    LifecycleEvent::UnloadFailed { error: e.to_string() },
                );
            }
        }
        result
    }

    async fn run_close_hooks(&self, args: CloseArgs) -> Result<(), Interrupted> {
        let args = Arc::new(args);

        let plugin = Arc::clone(&self.plugin);
        let ctx = Arc::clone(&self.ctx);
        let blocking_args = Arc::clone(&args);
        join_hook(tokio::task::spawn_blocking(move || plugin.close(&ctx, &blocking_args))).await?;

        let plugin = Arc::clone(&self.plugin);
        let ctx = Arc::clone(&self.ctx);
        join_hook(tokio::spawn(async move { plugin.on_close(&ctx, &args).await })).await
    }

    async fn persist(&self) -> Result<()> {
        let name = self.ctx.name();
        let store = self.ctx.store.read().await;
        if self.ctx.debug() {
            warn!(plugin = %name, "Debug mode: persistent data is not saved on unload");
            LifecycleLogger::log_event(name, LifecycleEvent::SaveSkipped);
            println!("{}", render_dump(name, store.data()));
            return Ok(());
        }
        store
            .save()
            .await
            .map_err(|e| PluginError::persistence(name, "saving", &e))
    }

    /// Mark the plugin failed after a hook panic, then resume the panic.
    fn fail_on_panic(
        &mut self,
        payload: Box<dyn Any + Send>,
        event: impl FnOnce(String) -> LifecycleEvent,
    ) -> ! {
        self.state = PluginState::Failed;
        let message = panic_message(payload.as_ref());
        error!(plugin = %self.ctx.name(), panic = %message, "Plugin hook panicked");
        LifecycleLogger::log_event(self.ctx.name(), event(format!("hook panicked: {message}")));
        std::panic::resume_unwind(payload)
    }
}

/// Why a load or unload sequence stopped early.
enum Interrupted {
    Error(PluginError),
    /// Held until the lifecycle has settled its state and revoked handlers.
    Panic(Box<dyn Any + Send>),
}

impl From<PluginError> for Interrupted {
    fn from(e: PluginError) -> Self {
        Self::Error(e)
    }
}

/// Await a hook running on its own task. Errors pass through unchanged.
async fn join_hook(handle: JoinHandle<AnyResult<()>>) -> Result<(), Interrupted> {
    match handle.await {
        Ok(result) => result.map_err(|e| Interrupted::Error(PluginError::Hook(e))),
        Err(e) if e.is_panic() => Err(Interrupted::Panic(e.into_panic())),
        Err(e) => Err(Interrupted::Error(PluginError::Hook(e.into()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::PriorityEventBus;
    use crate::scheduler::JobTable;
    use anyhow::bail;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Journal = Arc<std::sync::Mutex<Vec<String>>>;

    #[derive(Default)]
    struct Echo {
        name: &'static str,
        journal: Journal,
        fail_on_load: bool,
        fired: Arc<AtomicBool>,
        delivered_at_close: Arc<AtomicUsize>,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                name: "Echo",
                ..Default::default()
            }
        }

        fn note(&self, entry: impl Into<String>) {
            self.journal.lock().unwrap().push(entry.into());
        }
    }

    #[async_trait]
    impl Plugin for Echo {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new(self.name, "1.0")
        }

        fn init(&self, ctx: &PluginContext) -> AnyResult<()> {
            self.note("init");
            ctx.blocking_data_mut()["booted"] = json!(true);
            Ok(())
        }

        async fn on_load(&self, ctx: &PluginContext) -> AnyResult<()> {
            self.note("on_load");
            if self.fail_on_load {
                bail!("on_load refused");
            }
            let fired = Arc::clone(&self.fired);
            ctx.register_handler(
                "ping",
                move |_: &Event| -> HandlerOutcome {
                    fired.store(true, Ordering::SeqCst);
                    Ok(json!("pong"))
                },
                0,
            );
            Ok(())
        }

        fn close(&self, ctx: &PluginContext, args: &CloseArgs) -> AnyResult<()> {
            self.note(format!("close:{}:{}", ctx.active_handlers(), args.args.len()));
            Ok(())
        }

        async fn on_close(&self, ctx: &PluginContext, args: &CloseArgs) -> AnyResult<()> {
            self.note(format!("on_close:{}", args.kwargs.len()));
            let results = ctx.publish_async(Event::new("ping", Value::Null)).await;
            self.delivered_at_close.store(results.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        bus: PriorityEventBus,
        jobs: JobTable,
        config: PluginConfig,
    }

    impl Harness {
        fn new(root: &Path) -> Self {
            Self {
                bus: PriorityEventBus::new(),
                jobs: JobTable::new(),
                config: PluginConfig::new()
                    .with_plugins_dir(root.join("plugins"))
                    .with_persistent_dir(root.join("data")),
            }
        }

        fn build<P: Plugin>(&self, plugin: P) -> Result<PluginLifecycle<P>> {
            self.build_with(plugin, self.config.clone())
        }

        fn build_with<P: Plugin>(
            &self,
            plugin: P,
            config: PluginConfig,
        ) -> Result<PluginLifecycle<P>> {
            PluginLifecycle::new(
                plugin,
                Arc::new(self.bus.clone()),
                Arc::new(self.jobs.clone()),
                config,
            )
        }
    }

    #[tokio::test]
    async fn test_missing_identity_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let nameless = Echo { name: "", ..Echo::new() };
        let err = harness.build(nameless).err().unwrap();
        assert!(matches!(err, PluginError::Config(_)));
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_construction_creates_work_dir_and_flags_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let lifecycle = harness.build(Echo::new()).unwrap();
        let ctx = lifecycle.context();
        assert!(ctx.first_load());
        assert!(ctx.paths().work_dir.is_dir());
        assert_eq!(ctx.paths().data_file, dir.path().join("data/Echo/Echo.json"));
        assert!(ctx.dependencies().is_empty());
        assert_eq!(lifecycle.state(), PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_first_load_false_with_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let work_dir = dir.path().join("data/Echo");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(work_dir.join("Echo.json"), r#"{"count": 4}"#).unwrap();

        let mut lifecycle = harness.build(Echo::new()).unwrap();
        assert!(!lifecycle.context().first_load());
        lifecycle.onload().await.unwrap();
        assert_eq!(lifecycle.context().data().await["count"], 4);
    }

    #[tokio::test]
    async fn test_work_dir_that_is_a_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/Echo"), "").unwrap();

        let err = harness.build(Echo::new()).err().unwrap();
        assert!(matches!(err, PluginError::Load { .. }));
    }

    #[tokio::test]
    async fn test_echo_data_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let mut first = harness.build(Echo::new()).unwrap();
        assert!(first.context().first_load());
        first.onload().await.unwrap();
        assert_eq!(first.context().data().await["booted"], true);
        first.context().data_mut().await["count"] = json!(1);
        first.unload(CloseArgs::default()).await.unwrap();

        let mut second = harness.build(Echo::new()).unwrap();
        assert!(!second.context().first_load());
        second.onload().await.unwrap();
        assert_eq!(second.context().data().await["count"], 1);
    }

    #[tokio::test]
    async fn test_corrupt_data_self_heals_once() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let data_file = dir.path().join("data/Echo/Echo.json");
        std::fs::create_dir_all(data_file.parent().unwrap()).unwrap();
        std::fs::write(&data_file, "{ definitely not json").unwrap();

        let mut lifecycle = harness.build(Echo::new()).unwrap();
        lifecycle.onload().await.unwrap();

        assert_eq!(std::fs::read_to_string(&data_file).unwrap(), "{}");
        assert_eq!(*lifecycle.context().data().await, json!({ "booted": true }));
        assert_eq!(lifecycle.state(), PluginState::Active);
    }

    #[tokio::test]
    async fn test_unrecoverable_data_is_a_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let config = harness.config.clone().with_save_type("pickle");
        let journal = Journal::default();

        let mut lifecycle = harness
            .build_with(Echo { journal: Arc::clone(&journal), ..Echo::new() }, config)
            .unwrap();
        let err = lifecycle.onload().await.unwrap_err();

        assert!(matches!(err, PluginError::Runtime { ref plugin, .. } if plugin == "Echo"));
        assert_eq!(lifecycle.state(), PluginState::Failed);
        // Hooks never ran.
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_data_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let seed = json!({ "greeting": "hi" }).as_object().cloned().unwrap();
        let config = harness.config.clone().with_data(seed);

        let mut lifecycle = harness.build_with(Echo::new(), config).unwrap();
        lifecycle.onload().await.unwrap();
        assert_eq!(lifecycle.context().data().await["greeting"], "hi");
    }

    #[tokio::test]
    async fn test_hook_order_and_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let journal = Journal::default();

        let mut lifecycle = harness
            .build(Echo { journal: Arc::clone(&journal), ..Echo::new() })
            .unwrap();
        lifecycle.onload().await.unwrap();
        assert_eq!(harness.bus.handler_count("ping"), 1);
        assert_eq!(lifecycle.context().handler_ids().len(), 1);

        let kwargs = json!({ "reason": "shutdown" }).as_object().cloned().unwrap();
        lifecycle
            .unload(CloseArgs::new(vec![json!(1), json!(2)], kwargs))
            .await
            .unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["init", "on_load", "close:0:2", "on_close:1"]
        );
        assert_eq!(lifecycle.state(), PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_close_hook_publish_does_not_reach_own_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let plugin = Echo::new();
        let fired = Arc::clone(&plugin.fired);
        let delivered = Arc::clone(&plugin.delivered_at_close);

        let mut lifecycle = harness.build(plugin).unwrap();
        lifecycle.onload().await.unwrap();
        lifecycle.unload(CloseArgs::default()).await.unwrap();

        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(harness.bus.total_handlers(), 0);
    }

    fn lifecycle_records(log_dir: &Path) -> Vec<String> {
        let text: String = std::fs::read_dir(log_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(perch_logging::LIFECYCLE_LOG)
            })
            .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
            .collect();
        text.lines()
            .map(|line| {
                let record: Value = serde_json::from_str(line).unwrap();
                let entry: Value =
                    serde_json::from_str(record["fields"]["entry"].as_str().unwrap()).unwrap();
                entry["event"]["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_debug_unload_dumps_instead_of_writing() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let _logging = tracing::subscriber::set_default(perch_logging::build_subscriber(
            &log_dir, "off",
        ));
        let harness = Harness::new(dir.path());
        let config = harness.config.clone().with_debug(true);

        let mut lifecycle = harness.build_with(Echo::new(), config).unwrap();
        assert!(lifecycle.context().debug());
        lifecycle.onload().await.unwrap();
        let data_file = lifecycle.context().paths().data_file.clone();
        let before = std::fs::read_to_string(&data_file).unwrap();

        {
            let mut data = lifecycle.context().data_mut().await;
            data["count"] = json!(99);
            data["nested"] = json!({ "list": [1, 2, 3] });
        }
        assert_eq!(
            lifecycle.context().debug_dump().await,
            [
                "Echo",
                "├── booted: true",
                "├── count: 99",
                "└── nested",
                "    └── list",
                "        ├── [0]: 1",
                "        ├── [1]: 2",
                "        └── [2]: 3",
            ]
            .join("\n")
        );
        lifecycle.unload(CloseArgs::default()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&data_file).unwrap(), before);
        assert_eq!(
            lifecycle_records(&log_dir),
            vec!["constructed", "data_reset", "loaded", "save_skipped", "unloaded"]
        );
    }

    #[tokio::test]
    async fn test_save_failure_is_runtime_error_and_handlers_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let mut lifecycle = harness.build(Echo::new()).unwrap();
        lifecycle.onload().await.unwrap();
        lifecycle
            .context()
            .register_handler("extra", |_: &Event| -> HandlerOutcome { Ok(Value::Null) }, 3);
        std::fs::remove_dir_all(&lifecycle.context().paths().work_dir).unwrap();

        let err = lifecycle.unload(CloseArgs::default()).await.unwrap_err();
        assert!(matches!(err, PluginError::Runtime { ref plugin, .. } if plugin == "Echo"));
        assert_eq!(harness.bus.total_handlers(), 0);
        assert_eq!(lifecycle.state(), PluginState::Failed);
    }

    #[tokio::test]
    async fn test_unload_retry_saves_once_the_fault_clears() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let mut lifecycle = harness.build(Echo::new()).unwrap();
        lifecycle.onload().await.unwrap();
        lifecycle.context().data_mut().await["count"] = json!(7);
        let work_dir = lifecycle.context().paths().work_dir.clone();
        std::fs::remove_dir_all(&work_dir).unwrap();
        assert!(lifecycle.unload(CloseArgs::default()).await.is_err());

        std::fs::create_dir_all(&work_dir).unwrap();
        lifecycle.unload(CloseArgs::default()).await.unwrap();
        assert_eq!(lifecycle.state(), PluginState::Unloaded);

        let saved = std::fs::read_to_string(&lifecycle.context().paths().data_file).unwrap();
        let saved: Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved["count"], 7);
    }

    #[tokio::test]
    async fn test_hook_errors_propagate_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let mut lifecycle = harness
            .build(Echo { fail_on_load: true, ..Echo::new() })
            .unwrap();
        let err = lifecycle.onload().await.unwrap_err();
        assert!(matches!(err, PluginError::Hook(_)));
        assert_eq!(err.to_string(), "on_load refused");
        assert_eq!(lifecycle.state(), PluginState::Failed);

        // A failed plugin can still be torn down; its data is left alone.
        lifecycle.unload(CloseArgs::default()).await.unwrap();
        assert_eq!(lifecycle.state(), PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_sequence_misuse_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());

        let mut lifecycle = harness.build(Echo::new()).unwrap();
        assert!(matches!(
            lifecycle.unload(CloseArgs::default()).await,
            Err(PluginError::InvalidState { .. })
        ));
        lifecycle.onload().await.unwrap();
        assert!(matches!(
            lifecycle.onload().await,
            Err(PluginError::InvalidState { state: PluginState::Active, .. })
        ));
    }

    #[tokio::test]
    async fn test_scheduled_tasks_through_context() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let lifecycle = harness.build(Echo::new()).unwrap();
        let ctx = lifecycle.context();

        let ping = TaskSpec::new("ping", "5s", |_: &[Value], _: &Map<String, Value>| Ok(()));
        assert!(ctx.add_scheduled_task(ping).unwrap());
        assert!(harness.jobs.contains("ping"));
        assert!(ctx.remove_scheduled_task("ping"));
        assert!(!ctx.remove_scheduled_task("never-added"));
    }

    struct Exploding;

    #[async_trait]
    impl Plugin for Exploding {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new("Exploding", "0.1.0")
        }

        fn init(&self, _ctx: &PluginContext) -> AnyResult<()> {
            panic!("init exploded");
        }
    }

    #[tokio::test]
    #[should_panic(expected = "init exploded")]
    async fn test_init_panic_reaches_caller() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let mut lifecycle = harness.build(Exploding).unwrap();
        let _ = lifecycle.onload().await;
    }

    /// Registers a handler, then panics in the hook named by `stage`.
    struct Panicky {
        stage: &'static str,
    }

    impl Panicky {
        fn blow_up(&self, stage: &str, ctx: &PluginContext) {
            if self.stage == stage {
                ctx.register_handler("ping", |_: &Event| -> HandlerOutcome { Ok(Value::Null) }, 0);
                panic!("{stage} exploded");
            }
        }
    }

    #[async_trait]
    impl Plugin for Panicky {
        fn identity(&self) -> PluginIdentity {
            PluginIdentity::new("Panicky", "0.1.0")
        }

        async fn on_load(&self, ctx: &PluginContext) -> AnyResult<()> {
            self.blow_up("on_load", ctx);
            Ok(())
        }

        fn close(&self, ctx: &PluginContext, _args: &CloseArgs) -> AnyResult<()> {
            self.blow_up("close", ctx);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_on_load_panic_leaves_plugin_failed_and_unsubscribed() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let lifecycle = Arc::new(Mutex::new(harness.build(Panicky { stage: "on_load" }).unwrap()));

        let shared = Arc::clone(&lifecycle);
        let joined = tokio::spawn(async move { shared.lock().await.onload().await }).await;
        assert!(joined.unwrap_err().is_panic());

        let mut lifecycle = lifecycle.lock().await;
        assert_eq!(lifecycle.state(), PluginState::Failed);
        assert_eq!(harness.bus.total_handlers(), 0);
        lifecycle.unload(CloseArgs::default()).await.unwrap();
        assert_eq!(lifecycle.state(), PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_close_panic_still_sweeps_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let mut plugin = harness.build(Panicky { stage: "close" }).unwrap();
        plugin.onload().await.unwrap();
        let lifecycle = Arc::new(Mutex::new(plugin));

        let shared = Arc::clone(&lifecycle);
        let joined = tokio::spawn(async move {
            shared.lock().await.unload(CloseArgs::default()).await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        assert_eq!(lifecycle.lock().await.state(), PluginState::Failed);
        assert_eq!(harness.bus.total_handlers(), 0);
    }
}

//! Scheduled tasks.
//!
//! The `Scheduler` contract is what plugins register periodic jobs with. The
//! facade validates a task and forwards it; `JobTable` is an in-memory
//! scheduler that keeps the registered jobs and can tick them by hand.

use anyhow::Result as AnyResult;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PluginError, Result};

pub type JobFn = Arc<dyn Fn(&[Value], &Map<String, Value>) -> AnyResult<()> + Send + Sync>;
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;
pub type ArgsProvider = Arc<dyn Fn() -> Vec<Value> + Send + Sync>;
pub type KwargsProvider = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// When a job fires. Expressions (`"5s"`, `"08:30"`, ...) are interpreted by
/// the scheduler, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum Interval {
    Every(Duration),
    Expression(String),
}

impl Interval {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Every(d) if d.is_zero() => {
                Err(PluginError::InvalidTask("interval must be greater than zero".into()))
            }
            Self::Expression(e) if e.trim().is_empty() => {
                Err(PluginError::InvalidTask("interval expression is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

impl From<Duration> for Interval {
    fn from(d: Duration) -> Self {
        Self::Every(d)
    }
}

impl From<u64> for Interval {
    fn from(secs: u64) -> Self {
        Self::Every(Duration::from_secs(secs))
    }
}

impl From<f64> for Interval {
    fn from(secs: f64) -> Self {
        Self::Every(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}

impl From<&str> for Interval {
    fn from(expr: &str) -> Self {
        Self::Expression(expr.to_string())
    }
}

impl From<String> for Interval {
    fn from(expr: String) -> Self {
        Self::Expression(expr)
    }
}

/// A fully specified job as handed to the scheduler.
#[derive(Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub job: JobFn,
    pub interval: Interval,
    pub max_runs: Option<u32>,
    pub run_count: u32,
    pub conditions: Vec<Condition>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Map<String, Value>,
    pub args_provider: Option<ArgsProvider>,
    pub kwargs_provider: Option<KwargsProvider>,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("max_runs", &self.max_runs)
            .field("run_count", &self.run_count)
            .field("conditions", &self.conditions.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of one manual tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTick {
    NotFound,
    /// A condition returned false.
    Skipped,
    Ran,
    /// Ran and reached `max_runs`; the job was removed.
    Retired,
    /// The job is already running.
    Busy,
}

impl ScheduledJob {
    pub fn exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    /// Run once if every condition allows it. Providers take precedence over
    /// static arguments.
    pub fn run_once(&mut self) -> AnyResult<bool> {
        if !self.conditions.iter().all(|c| c()) {
            return Ok(false);
        }
        let args = match &self.args_provider {
            Some(provider) => provider(),
            None => self.args.clone().unwrap_or_default(),
        };
        let kwargs = match &self.kwargs_provider {
            Some(provider) => provider(),
            None => self.kwargs.clone(),
        };
        self.run_count += 1;
        (self.job)(&args, &kwargs)?;
        Ok(true)
    }
}

/// Shared facility executing named, interval-driven jobs.
pub trait Scheduler: Send + Sync {
    /// Register a job. Returns false if the name is already taken.
    fn add_job(&self, job: ScheduledJob) -> bool;

    /// Returns whether a job with this name was found and removed.
    fn remove_job(&self, name: &str) -> bool;
}

/// A table entry. A job is checked out while it runs so the table is not
/// locked during the call.
enum Slot {
    Idle(ScheduledJob),
    Running,
}

/// In-memory scheduler. Jobs only run when ticked through `run_now`.
#[derive(Default, Clone)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<String, Slot>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Runs so far. `None` for unknown jobs and for jobs currently running.
    pub fn run_count(&self, name: &str) -> Option<u32> {
        match self.jobs().get(name) {
            Some(Slot::Idle(job)) => Some(job.run_count),
            _ => None,
        }
    }

    /// Tick one job. The name stays taken while the job runs, so the job may
    /// remove itself or register other jobs, and a removal made meanwhile is
    /// honored once it returns.
    pub fn run_now(&self, name: &str) -> AnyResult<JobTick> {
        let mut job = match self.jobs().get_mut(name) {
            None => return Ok(JobTick::NotFound),
            Some(slot) => match std::mem::replace(slot, Slot::Running) {
                Slot::Idle(job) => job,
                Slot::Running => return Ok(JobTick::Busy),
            },
        };
        let outcome = job.run_once();

        let tick = match &outcome {
            Ok(false) => JobTick::Skipped,
            _ if job.exhausted() => JobTick::Retired,
            _ => JobTick::Ran,
        };

        let mut jobs = self.jobs();
        match jobs.get_mut(name) {
            Some(slot @ Slot::Running) => {
                if tick == JobTick::Retired {
                    jobs.remove(name);
                    info!(job = %name, runs = job.run_count, "Job reached max runs");
                } else {
                    *slot = Slot::Idle(job);
                }
            }
            _ => debug!(job = %name, "Job removed while running"),
        }
        outcome.map(|_| tick)
    }
}

impl Scheduler for JobTable {
    fn add_job(&self, job: ScheduledJob) -> bool {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job.name) {
            warn!(job = %job.name, "Job name already registered");
            return false;
        }
        debug!(job = %job.name, interval = ?job.interval, "Job added");
        jobs.insert(job.name.clone(), Slot::Idle(job));
        true
    }

    fn remove_job(&self, name: &str) -> bool {
        let removed = self.jobs().remove(name).is_some();
        if removed {
            debug!(job = %name, "Job removed");
        }
        removed
    }
}

/// A periodic task as described by plugin code.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub job: JobFn,
    pub interval: Interval,
    pub conditions: Vec<Condition>,
    pub max_runs: Option<u32>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub args_provider: Option<ArgsProvider>,
    pub kwargs_provider: Option<KwargsProvider>,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, interval: impl Into<Interval>, job: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            job: Arc::new(job),
            interval: interval.into(),
            conditions: Vec::new(),
            max_runs: None,
            args: None,
            kwargs: None,
            args_provider: None,
            kwargs_provider: None,
        }
    }

    pub fn condition(mut self, condition: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.conditions.push(Arc::new(condition));
        self
    }

    pub fn max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn args_provider(
        mut self,
        provider: impl Fn() -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.args_provider = Some(Arc::new(provider));
        self
    }

    pub fn kwargs_provider(
        mut self,
        provider: impl Fn() -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.kwargs_provider = Some(Arc::new(provider));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidTask("task name is empty".into()));
        }
        self.interval.validate()?;
        if self.max_runs == Some(0) {
            return Err(PluginError::InvalidTask(format!(
                "task '{}': max_runs must be at least 1",
                self.name
            )));
        }
        if self.args.is_some() && self.args_provider.is_some() {
            return Err(PluginError::InvalidTask(format!(
                "task '{}': args and args_provider are mutually exclusive",
                self.name
            )));
        }
        if self.kwargs.is_some() && self.kwargs_provider.is_some() {
            return Err(PluginError::InvalidTask(format!(
                "task '{}': kwargs and kwargs_provider are mutually exclusive",
                self.name
            )));
        }
        Ok(())
    }

    fn into_job(self) -> ScheduledJob {
        ScheduledJob {
            name: self.name,
            job: self.job,
            interval: self.interval,
            max_runs: self.max_runs,
            run_count: 0,
            conditions: self.conditions,
            args: self.args,
            kwargs: self.kwargs.unwrap_or_default(),
            args_provider: self.args_provider,
            kwargs_provider: self.kwargs_provider,
        }
    }
}

/// Validating pass-through to the shared scheduler. No retries, no queuing.
#[derive(Clone)]
pub struct ScheduledTaskFacade {
    plugin: String,
    scheduler: Arc<dyn Scheduler>,
}

impl ScheduledTaskFacade {
    pub fn new(plugin: impl Into<String>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            plugin: plugin.into(),
            scheduler,
        }
    }

    /// Forward a task. Invalid specs are errors; a scheduler refusal
    /// (duplicate name) is `Ok(false)`.
    pub fn add(&self, spec: TaskSpec) -> Result<bool> {
        spec.validate()?;
        let name = spec.name.clone();
        let added = self.scheduler.add_job(spec.into_job());
        debug!(plugin = %self.plugin, task = %name, added, "Add scheduled task");
        Ok(added)
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.scheduler.remove_job(name);
        debug!(plugin = %self.plugin, task = %name, removed, "Remove scheduled task");
        removed
    }
}

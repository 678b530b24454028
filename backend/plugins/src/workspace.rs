//! Workspace scope: run filesystem-relative plugin code inside its work dir.
//!
//! The working directory is process-wide state, so every scope takes a global
//! lock for as long as its guard lives. Scopes do not nest.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

static CWD_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
pub struct WorkspaceScope {
    dir: PathBuf,
}

/// Restores the previous working directory when dropped.
#[must_use = "the previous directory is restored as soon as the guard drops"]
pub struct WorkspaceGuard {
    previous: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl WorkspaceScope {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Switch the process working directory to this scope's directory.
    pub fn enter(&self) -> io::Result<WorkspaceGuard> {
        let lock = CWD_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(&self.dir)?;
        debug!(dir = %self.dir.display(), "Entered plugin workspace");
        Ok(WorkspaceGuard {
            previous,
            _lock: lock,
        })
    }

    /// Run `f` inside the workspace, restoring the previous directory afterwards.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> io::Result<T> {
        let _guard = self.enter()?;
        Ok(f())
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            warn!(
                dir = %self.previous.display(),
                error = %e,
                "Failed to restore working directory"
            );
        }
    }
}

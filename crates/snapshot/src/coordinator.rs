//! Cross-engine state for shadow repositories: one FIFO lock and one GC
//! timestamp per repository path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

/// Shared by every [`SnapshotEngine`](crate::SnapshotEngine) of a process.
///
/// Operations on the same shadow repository run one at a time in arrival
/// order (`tokio::sync::Mutex` is fair); different repositories never wait on
/// each other.
#[derive(Debug, Default)]
pub struct RepoCoordinator {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    last_gc: Mutex<HashMap<PathBuf, Instant>>,
}

impl RepoCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `repo`.
    pub async fn lock(&self, repo: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(repo.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Claim a GC run for `repo` if none happened within `interval`.
    ///
    /// A repository not yet collected by this process is due.
    pub fn claim_gc(&self, repo: &Path, interval: Duration) -> bool {
        let now = Instant::now();
        let mut last_gc = self.last_gc.lock();
        match last_gc.get(repo) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                last_gc.insert(repo.to_path_buf(), now);
                true
            }
        }
    }

    pub fn mark_gc(&self, repo: &Path) {
        self.last_gc.lock().insert(repo.to_path_buf(), Instant::now());
    }

    pub fn last_gc(&self, repo: &Path) -> Option<Instant> {
        self.last_gc.lock().get(repo).copied()
    }
}

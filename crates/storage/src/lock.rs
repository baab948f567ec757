//! Named async read/write locks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Registry entries beyond this count trigger a sweep of idle locks.
const SWEEP_THRESHOLD: usize = 256;

/// One `RwLock` per name, created on demand.
///
/// Readers of the same name overlap; a writer excludes every other reader and
/// writer of that name. Different names never contend.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > SWEEP_THRESHOLD {
            // Only the map holds idle locks.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(name.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub async fn read(&self, name: &Path) -> OwnedRwLockReadGuard<()> {
        self.entry(name).read_owned().await
    }

    pub async fn write(&self, name: &Path) -> OwnedRwLockWriteGuard<()> {
        self.entry(name).write_owned().await
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn readers_overlap() {
        let registry = LockRegistry::new();
        let name = Path::new("a.json");
        let _first = registry.read(name).await;
        let second = tokio::time::timeout(Duration::from_millis(200), registry.read(name)).await;
        assert!(second.is_ok(), "second reader should not wait");
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let registry = LockRegistry::new();
        let name = Path::new("a.json");
        let _writer = registry.write(name).await;
        let reader = tokio::time::timeout(Duration::from_millis(50), registry.read(name)).await;
        assert!(reader.is_err(), "reader must wait for the writer");
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let registry = LockRegistry::new();
        let _writer = registry.write(Path::new("a.json")).await;
        let other =
            tokio::time::timeout(Duration::from_millis(200), registry.write(Path::new("b.json")))
                .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn idle_locks_are_swept() {
        let registry = LockRegistry::new();
        for i in 0..(SWEEP_THRESHOLD + 10) {
            let _guard = registry.read(Path::new(&format!("{i}.json"))).await;
        }
        let _guard = registry.read(Path::new("last.json")).await;
        assert!(registry.len() <= SWEEP_THRESHOLD + 1);
    }
}

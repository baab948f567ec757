//! Legacy per-key JSON file store.
//!
//! Each key maps to `<dir>/<segments...>.json`. Reads take the key's shared
//! lock, writes and read-modify-write updates take its exclusive lock.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StorageError, StorageResult};
use crate::key::StorageKey;
use crate::lock::LockRegistry;

const EXTENSION: &str = "json";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct FileStore {
    dir: PathBuf,
    locks: LockRegistry,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: LockRegistry::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the document for `key`. Fails with
    /// [`StorageError::InvalidKey`] for segments that would leave [`Self::dir`].
    pub fn path_for(&self, key: &StorageKey) -> StorageResult<PathBuf> {
        key.check_segments()?;
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.joined(),
                reason: "empty key names no document".to_string(),
            });
        }
        Ok(self.dir.join(key.file_path()))
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &StorageKey) -> StorageResult<T> {
        let path = self.path_for(key)?;
        let _guard = self.locks.read(&path).await;
        read_json(&path, key).await
    }

    pub async fn write<T: Serialize>(&self, key: &StorageKey, value: &T) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.locks.write(&path).await;
        write_json(&path, value).await
    }

    /// Read, mutate and persist the document while holding the key's write lock
    /// for the whole cycle.
    pub async fn update<T, F>(&self, key: &StorageKey, mutate: F) -> StorageResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let path = self.path_for(key)?;
        let _guard = self.locks.write(&path).await;
        let mut value: T = read_json(&path, key).await?;
        mutate(&mut value);
        write_json(&path, &value).await?;
        Ok(value)
    }

    /// Remove the document. Removing a missing key is not an error.
    pub async fn remove(&self, key: &StorageKey) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.locks.write(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Every key stored under `prefix`, sorted.
    pub async fn list(&self, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>> {
        prefix.check_segments()?;
        let root = self.dir.join(prefix.dir_path());
        let prefix = prefix.clone();
        tokio::task::spawn_blocking(move || scan(&root, &prefix))
            .await
            .map_err(|e| StorageError::Other(format!("Task execution failed: {}", e)))?
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path, key: &StorageKey) -> StorageResult<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StorageError::not_found(key.joined()));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let content = serde_json::to_vec_pretty(value)?;
    replace_file(path, content).await
}

/// Atomically replace `path` with `bytes`, creating parent directories.
pub(crate) async fn replace_file(path: &Path, bytes: Vec<u8>) -> StorageResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || replace_file_blocking(&path, &bytes))
        .await
        .map_err(|e| StorageError::Other(format!("Task execution failed: {}", e)))??;
    Ok(())
}

/// Write `bytes` to a sibling temp file, then rename it over `path`. Readers
/// see either the old document or the new one, never a torn write.
pub(crate) fn replace_file_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        ));
    };
    std::fs::create_dir_all(parent)?;
    let temp = parent.join(format!(
        ".{}.{}.{}.tmp",
        name.to_string_lossy(),
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let written = std::fs::File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| std::fs::rename(&temp, path)) {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Walk `root` recursively and turn every `*.json` file into a key below `prefix`.
pub(crate) fn scan(root: &Path, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for entry in ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build()
    {
        let entry = entry.map_err(|e| {
            StorageError::Other(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.with_extension("");

        let mut key = prefix.clone();
        for component in rel.components() {
            key = key.child(component.as_os_str().to_string_lossy().into_owned());
        }
        keys.push(key);
    }

    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let err = store
            .read::<Value>(&StorageKey::from(["project", "p1"]))
            .await
            .unwrap_err();
        match err {
            StorageError::NotFound { key } => assert_eq!(key, "project/p1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let key = StorageKey::from(["part", "msg_1", "prt_1"]);
        store.write(&key, &json!({"text": "hi"})).await.unwrap();

        assert!(dir.path().join("part/msg_1/prt_1.json").exists());
        let value: Value = store.read(&key).await.unwrap();
        assert_eq!(value, json!({"text": "hi"}));

        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert!(store.read::<Value>(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_on_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let err = store
            .update::<Value, _>(&StorageKey::from(["x"]), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let key = StorageKey::from(["counter"]);
        store.write(&key, &json!({"n": 0})).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update::<Value, _>(&key, |v| {
                        let n = v["n"].as_i64().unwrap();
                        v["n"] = json!(n + 1);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let value: Value = store.read(&key).await.unwrap();
        assert_eq!(value["n"], json!(32));
    }

    #[tokio::test]
    async fn segments_cannot_escape_the_store() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("data");
        let store = FileStore::new(&dir);
        let outside = root.path().join("outside");

        for key in [
            StorageKey::new(["notes".to_string(), outside.to_string_lossy().into_owned()]),
            StorageKey::from(["notes", "../../outside"]),
            StorageKey::from(["..", "outside"]),
            StorageKey::from(["notes", "a/b"]),
            StorageKey::from(["notes", "."]),
            StorageKey::from(["notes", ""]),
            StorageKey::default(),
        ] {
            let err = store.write(&key, &json!({})).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{key:?}: {err:?}");
            assert!(matches!(
                store.read::<Value>(&key).await.unwrap_err(),
                StorageError::InvalidKey { .. }
            ));
            assert!(store.remove(&key).await.is_err());
        }
        assert!(!root.path().join("outside.json").exists());
        assert!(!dir.exists());

        assert!(store.list(&StorageKey::from([".."])).await.is_err());
        assert!(store.list(&StorageKey::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_replace_without_leaving_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let key = StorageKey::from(["project", "p1"]);
        store.write(&key, &json!({"v": 1})).await.unwrap();
        store.write(&key, &json!({"v": 2})).await.unwrap();
        store
            .update::<Value, _>(&key, |v| v["v"] = json!(3))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("project"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["p1.json"]);
        let value: Value = store.read(&key).await.unwrap();
        assert_eq!(value, json!({"v": 3}));
    }

    #[tokio::test]
    async fn list_returns_sorted_full_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        for key in [
            ["part", "msg_2", "prt_1"],
            ["part", "msg_1", "prt_2"],
            ["part", "msg_1", "prt_1"],
        ] {
            store.write(&StorageKey::from(key), &json!({})).await.unwrap();
        }
        std::fs::write(dir.path().join("part/msg_1/notes.txt"), "ignored").unwrap();

        let keys = store.list(&StorageKey::from(["part"])).await.unwrap();
        assert_eq!(
            keys,
            vec![
                StorageKey::from(["part", "msg_1", "prt_1"]),
                StorageKey::from(["part", "msg_1", "prt_2"]),
                StorageKey::from(["part", "msg_2", "prt_1"]),
            ]
        );

        let none = store.list(&StorageKey::from(["missing"])).await.unwrap();
        assert!(none.is_empty());
    }
}

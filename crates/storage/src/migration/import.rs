//! One-time bulk import of JSON documents into the record store.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};
use crate::file_store::scan;
use crate::key::StorageKey;
use crate::record::{MessageRecord, RecordStore};

/// Metadata key of the one-shot import flag.
pub const JSON_MIGRATED_KEY: &str = "json_migrated";

/// Counts of documents imported by [`import_json`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub sessions: usize,
    pub messages: usize,
    pub parts: usize,
    pub diffs: usize,
    /// Unreadable, malformed or orphaned documents left behind on disk.
    pub skipped: usize,
}

pub async fn is_imported(store: &dyn RecordStore) -> StorageResult<bool> {
    Ok(store.get_meta(JSON_MIGRATED_KEY).await?.as_deref() == Some("1"))
}

/// Copy every session, message (with its parts) and diff document under `dir`
/// into `store`.
///
/// Returns `Ok(None)` without touching anything when the flag is already set.
/// The flag is written only after every document was processed, so an import
/// interrupted by a store error is retried in full on the next startup; upserts
/// make the retry harmless.
pub async fn import_json(
    dir: &Path,
    store: &dyn RecordStore,
) -> StorageResult<Option<ImportStats>> {
    if is_imported(store).await? {
        debug!("JSON documents already imported");
        return Ok(None);
    }

    let mut stats = ImportStats::default();

    for key in scan_dir(dir, "session").await? {
        let [_, project_id, session_id] = key.segments() else {
            stats.skipped += 1;
            continue;
        };
        let Some(doc) = load(dir, &key, &mut stats).await else {
            continue;
        };
        if !store.upsert_session(project_id, session_id, &doc).await? {
            warn!(
                "Session {} already belongs to another project; {} left on disk",
                session_id, key
            );
            stats.skipped += 1;
            continue;
        }
        stats.sessions += 1;
    }

    let mut parts_by_message: HashMap<String, Vec<Value>> = HashMap::new();
    for key in scan_dir(dir, "part").await? {
        let [_, message_id, _part_id] = key.segments() else {
            stats.skipped += 1;
            continue;
        };
        let Some(doc) = load(dir, &key, &mut stats).await else {
            continue;
        };
        parts_by_message
            .entry(message_id.clone())
            .or_default()
            .push(doc);
    }

    for key in scan_dir(dir, "message").await? {
        let [_, session_id, message_id] = key.segments() else {
            stats.skipped += 1;
            continue;
        };
        let Some(info) = load(dir, &key, &mut stats).await else {
            continue;
        };
        let mut record = MessageRecord {
            info,
            parts: parts_by_message.remove(message_id).unwrap_or_default(),
        };
        record.sort_parts();
        stats.parts += record.parts.len();
        store.upsert_message(session_id, message_id, &record).await?;
        stats.messages += 1;
    }

    let orphaned: usize = parts_by_message.values().map(Vec::len).sum();
    if orphaned > 0 {
        warn!("{} parts reference messages that do not exist; left on disk", orphaned);
        stats.skipped += orphaned;
    }

    for key in scan_dir(dir, "session_diff").await? {
        let [_, session_id] = key.segments() else {
            stats.skipped += 1;
            continue;
        };
        let Some(doc) = load(dir, &key, &mut stats).await else {
            continue;
        };
        store.upsert_diff(session_id, &doc).await?;
        stats.diffs += 1;
    }

    store.set_meta(JSON_MIGRATED_KEY, "1").await?;
    info!(
        "Imported {} sessions, {} messages ({} parts), {} diffs; skipped {}",
        stats.sessions, stats.messages, stats.parts, stats.diffs, stats.skipped
    );
    Ok(Some(stats))
}

async fn scan_dir(dir: &Path, kind: &str) -> StorageResult<Vec<StorageKey>> {
    let root: PathBuf = dir.join(kind);
    let prefix = StorageKey::from([kind]);
    tokio::task::spawn_blocking(move || scan(&root, &prefix))
        .await
        .map_err(|e| StorageError::Other(format!("Task execution failed: {}", e)))?
}

async fn load(dir: &Path, key: &StorageKey, stats: &mut ImportStats) -> Option<Value> {
    let path = dir.join(key.file_path());
    let parsed = match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match parsed {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!("Skipping {} during import: {}", path.display(), e);
            stats.skipped += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SqliteRecordStore;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn put(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn imports_every_kind_once() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), "session/proj/ses_1.json", r#"{"id":"ses_1"}"#);
        put(dir.path(), "message/ses_1/msg_1.json", r#"{"id":"msg_1"}"#);
        put(dir.path(), "part/msg_1/prt_2.json", r#"{"id":"prt_2"}"#);
        put(dir.path(), "part/msg_1/prt_1.json", r#"{"id":"prt_1"}"#);
        put(dir.path(), "part/msg_gone/prt_1.json", r#"{"id":"prt_1"}"#);
        put(dir.path(), "session_diff/ses_1.json", r#"[{"file":"a"}]"#);
        put(dir.path(), "session/proj/broken.json", "{not json");

        let store = SqliteRecordStore::open_in_memory().unwrap();
        let stats = import_json(dir.path(), &store).await.unwrap().unwrap();

        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.parts, 2);
        assert_eq!(stats.diffs, 1);
        assert_eq!(stats.skipped, 2);

        let message = store.get_message("ses_1", "msg_1").await.unwrap().unwrap();
        assert_eq!(
            message.parts,
            vec![json!({"id": "prt_1"}), json!({"id": "prt_2"})]
        );
        assert_eq!(
            store.get_diff("ses_1").await.unwrap(),
            Some(json!([{"file": "a"}]))
        );
        assert!(is_imported(&store).await.unwrap());

        // Later edits on disk are not re-imported.
        put(dir.path(), "session/proj/ses_9.json", r#"{"id":"ses_9"}"#);
        assert!(import_json(dir.path(), &store).await.unwrap().is_none());
        assert!(store.get_session("ses_9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_directory_still_sets_flag() {
        let dir = TempDir::new().unwrap();
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let stats = import_json(dir.path(), &store).await.unwrap().unwrap();
        assert_eq!(stats, ImportStats::default());
        assert!(is_imported(&store).await.unwrap());
    }
}

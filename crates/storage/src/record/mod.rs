//! Backing record store: record-level CRUD for sessions, messages and diffs.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageResult;

/// A message together with its parts.
///
/// Parts are kept in ascending part-id order; the store reorders on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub info: Value,
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl MessageRecord {
    pub fn new(info: Value) -> Self {
        Self {
            info,
            parts: Vec::new(),
        }
    }

    /// Stable sort of parts by their `id` field; parts without one sort first.
    pub fn sort_parts(&mut self) {
        self.parts.sort_by(|a, b| part_id(a).cmp(&part_id(b)));
    }
}

/// The `id` field of a part document, if present.
pub fn part_id(part: &Value) -> Option<&str> {
    part.get("id").and_then(Value::as_str)
}

/// A session row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub project_id: String,
    pub data: Value,
}

/// One page of identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub ids: Vec<String>,
    /// Cursor for the next page; `None` when this was the last page.
    pub next: Option<String>,
}

/// Record-level storage contract the facade routes recognized keys to.
///
/// All `get_*` methods return `Ok(None)` for a missing record; translating that
/// into `NotFound` is the facade's job.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a session. A session id already stored under another
    /// project is left untouched and `false` is returned.
    async fn upsert_session(
        &self,
        project_id: &str,
        session_id: &str,
        data: &Value,
    ) -> StorageResult<bool>;
    async fn get_session(&self, session_id: &str) -> StorageResult<Option<SessionRow>>;
    /// Returns whether a row was removed. Sessions of other projects are kept.
    async fn remove_session(&self, project_id: &str, session_id: &str) -> StorageResult<bool>;
    async fn list_sessions(
        &self,
        project_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Page>;

    async fn upsert_message(
        &self,
        session_id: &str,
        message_id: &str,
        record: &MessageRecord,
    ) -> StorageResult<()>;
    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> StorageResult<Option<MessageRecord>>;
    async fn remove_message(&self, session_id: &str, message_id: &str) -> StorageResult<bool>;
    async fn list_messages(
        &self,
        session_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Page>;

    async fn upsert_diff(&self, session_id: &str, diffs: &Value) -> StorageResult<()>;
    async fn get_diff(&self, session_id: &str) -> StorageResult<Option<Value>>;
    async fn remove_diff(&self, session_id: &str) -> StorageResult<bool>;

    async fn get_meta(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> StorageResult<()>;

    /// (Re)create structural indexes. Idempotent; run on every startup.
    async fn ensure_indexes(&self) -> StorageResult<()>;
}

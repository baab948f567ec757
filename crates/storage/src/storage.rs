//! Storage facade.
//!
//! Every public call first awaits the one-time initialization (layout
//! migrations, bulk import, index maintenance) and then dispatches on the
//! key's [`KeyRoute`]: record-store shapes go to the [`RecordStore`],
//! everything else to the legacy [`FileStore`].

use log::{info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::file_store::FileStore;
use crate::key::{KeyRoute, StorageKey};
use crate::migration::import::{ImportStats, import_json, is_imported};
use crate::migration::{MigrationPipeline, SkippedMigration, read_cursor};
use crate::record::{MessageRecord, RecordStore, SqliteRecordStore};

/// Page size used when draining record-store listings.
const LIST_PAGE_SIZE: usize = 200;

/// Metadata key holding every migration step ever skipped, as a JSON array.
pub const SKIPPED_MIGRATIONS_KEY: &str = "migration.skipped";

/// Observable state of the one-time initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageHealth {
    /// Cursor persisted after this process ran the pipeline.
    pub migration_cursor: usize,
    /// Steps applied by this process.
    pub applied_migrations: Vec<usize>,
    /// Every step skipped in the lifetime of the data directory.
    pub skipped_migrations: Vec<SkippedMigration>,
    pub json_imported: bool,
    /// Present only when this process performed the bulk import.
    pub import: Option<ImportStats>,
}

impl StorageHealth {
    pub fn is_degraded(&self) -> bool {
        !self.skipped_migrations.is_empty()
    }
}

pub struct Storage {
    dir: PathBuf,
    files: FileStore,
    records: Arc<dyn RecordStore>,
    pipeline: MigrationPipeline,
    init: OnceCell<Result<StorageHealth, String>>,
}

impl Storage {
    /// Open the SQLite record store named by `config` with the standard
    /// migration steps.
    pub async fn open(config: &StorageConfig) -> StorageResult<Self> {
        let records = SqliteRecordStore::open(config.database_path()).await?;
        Ok(Self::new(
            config.data_dir.clone(),
            Arc::new(records),
            MigrationPipeline::default(),
        ))
    }

    pub fn new(
        dir: impl Into<PathBuf>,
        records: Arc<dyn RecordStore>,
        pipeline: MigrationPipeline,
    ) -> Self {
        let dir = dir.into();
        Self {
            files: FileStore::new(dir.clone()),
            dir,
            records,
            pipeline,
            init: OnceCell::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run (or await the in-flight run of) the one-time initialization.
    ///
    /// The outcome is cached: concurrent first callers share one run, and a
    /// failed initialization keeps failing with the same error.
    async fn ready(&self) -> StorageResult<&StorageHealth> {
        self.init
            .get_or_init(|| async { self.initialize().await.map_err(|e| e.to_string()) })
            .await
            .as_ref()
            .map_err(|e| StorageError::Init(e.clone()))
    }

    async fn initialize(&self) -> StorageResult<StorageHealth> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let report = self.pipeline.run(&self.dir).await?;
        let skipped = self.record_skipped(&report.skipped).await?;
        if !skipped.is_empty() {
            warn!(
                "Storage running with {} skipped migration(s): {:?}",
                skipped.len(),
                skipped.iter().map(|s| s.index).collect::<Vec<_>>()
            );
        }

        let import = import_json(&self.dir, self.records.as_ref()).await?;
        self.records.ensure_indexes().await?;

        let health = StorageHealth {
            migration_cursor: read_cursor(&self.dir).await,
            applied_migrations: report.applied,
            skipped_migrations: skipped,
            json_imported: is_imported(self.records.as_ref()).await?,
            import,
        };
        info!(
            "Storage ready at {} (migration cursor {})",
            self.dir.display(),
            health.migration_cursor
        );
        Ok(health)
    }

    /// Merge newly skipped steps into the persisted list and return the full list.
    async fn record_skipped(
        &self,
        new: &[SkippedMigration],
    ) -> StorageResult<Vec<SkippedMigration>> {
        let persisted = self.records.get_meta(SKIPPED_MIGRATIONS_KEY).await?;
        let mut all: Vec<SkippedMigration> = match persisted {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        if new.is_empty() {
            return Ok(all);
        }
        all.extend(new.iter().cloned());
        self.records
            .set_meta(SKIPPED_MIGRATIONS_KEY, &serde_json::to_string(&all)?)
            .await?;
        Ok(all)
    }

    /// Initialization outcome; initializes the store if needed.
    pub async fn health(&self) -> StorageResult<StorageHealth> {
        self.ready().await.cloned()
    }

    pub async fn read<T: DeserializeOwned>(&self, key: impl Into<StorageKey>) -> StorageResult<T> {
        self.ready().await?;
        let key = key.into();
        match key.route() {
            KeyRoute::File => self.files.read(&key).await,
            route => Ok(serde_json::from_value(self.read_routed(&key, route).await?)?),
        }
    }

    pub async fn write<T: Serialize>(
        &self,
        key: impl Into<StorageKey>,
        value: &T,
    ) -> StorageResult<()> {
        self.ready().await?;
        let key = key.into();
        match key.route() {
            KeyRoute::File => self.files.write(&key, value).await,
            route => {
                self.write_routed(&key, route, serde_json::to_value(value)?)
                    .await
            }
        }
    }

    /// Load, mutate and persist the full value.
    ///
    /// File-store keys hold their write lock for the whole cycle; record-store
    /// keys are re-upserted whole.
    pub async fn update<T, F>(&self, key: impl Into<StorageKey>, mutate: F) -> StorageResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        self.ready().await?;
        let key = key.into();
        match key.route() {
            KeyRoute::File => self.files.update(&key, mutate).await,
            route => {
                let mut value: T = serde_json::from_value(self.read_routed(&key, route).await?)?;
                mutate(&mut value);
                self.write_routed(&key, route, serde_json::to_value(&value)?)
                    .await?;
                Ok(value)
            }
        }
    }

    /// Remove the record. Removing a missing record is not an error.
    pub async fn remove(&self, key: impl Into<StorageKey>) -> StorageResult<()> {
        self.ready().await?;
        let key = key.into();
        match key.route() {
            KeyRoute::File => self.files.remove(&key).await,
            KeyRoute::Message {
                session_id,
                message_id,
            } => {
                self.records.remove_message(session_id, message_id).await?;
                Ok(())
            }
            KeyRoute::Session {
                project_id,
                session_id,
            } => {
                self.records.remove_session(project_id, session_id).await?;
                Ok(())
            }
            KeyRoute::SessionDiff { session_id } => {
                self.records.remove_diff(session_id).await?;
                Ok(())
            }
            KeyRoute::Messages { .. } | KeyRoute::Sessions { .. } => {
                Err(listing_key(&key, "cannot remove a collection"))
            }
        }
    }

    /// Keys stored under `prefix`.
    ///
    /// Collection prefixes (`["message", session]`, `["session", project]`) list
    /// from the record store in id order; other record-store shapes name a single
    /// record and are rejected; everything else is a sorted file scan.
    pub async fn list(&self, prefix: impl Into<StorageKey>) -> StorageResult<Vec<StorageKey>> {
        self.ready().await?;
        let prefix = prefix.into();
        match prefix.route() {
            KeyRoute::File => self.files.list(&prefix).await,
            KeyRoute::Messages { session_id } => Ok(self
                .message_ids(session_id)
                .await?
                .into_iter()
                .map(|id| prefix.child(id))
                .collect()),
            KeyRoute::Sessions { project_id } => Ok(self
                .session_ids(project_id)
                .await?
                .into_iter()
                .map(|id| prefix.child(id))
                .collect()),
            KeyRoute::Message { .. } | KeyRoute::Session { .. } | KeyRoute::SessionDiff { .. } => {
                Err(StorageError::InvalidKey {
                    key: prefix.joined(),
                    reason: "names a single record, not a collection".to_string(),
                })
            }
        }
    }

    async fn read_routed(&self, key: &StorageKey, route: KeyRoute<'_>) -> StorageResult<Value> {
        let not_found = || StorageError::not_found(key.joined());
        match route {
            KeyRoute::Message {
                session_id,
                message_id,
            } => {
                let record = self
                    .records
                    .get_message(session_id, message_id)
                    .await?
                    .ok_or_else(not_found)?;
                Ok(serde_json::to_value(record)?)
            }
            KeyRoute::Messages { session_id } => {
                let mut records = Vec::new();
                for id in self.message_ids(session_id).await? {
                    // Removed between listing and fetching.
                    if let Some(record) = self.records.get_message(session_id, &id).await? {
                        records.push(serde_json::to_value(record)?);
                    }
                }
                Ok(Value::Array(records))
            }
            KeyRoute::Session {
                project_id,
                session_id,
            } => match self.records.get_session(session_id).await? {
                Some(row) if row.project_id == project_id => Ok(row.data),
                _ => Err(not_found()),
            },
            KeyRoute::Sessions { project_id } => {
                let mut sessions = Vec::new();
                for id in self.session_ids(project_id).await? {
                    if let Some(row) = self.records.get_session(&id).await? {
                        sessions.push(row.data);
                    }
                }
                Ok(Value::Array(sessions))
            }
            KeyRoute::SessionDiff { session_id } => self
                .records
                .get_diff(session_id)
                .await?
                .ok_or_else(not_found),
            KeyRoute::File => Err(StorageError::InvalidKey {
                key: key.joined(),
                reason: "not a record-store key".to_string(),
            }),
        }
    }

    async fn write_routed(
        &self,
        key: &StorageKey,
        route: KeyRoute<'_>,
        value: Value,
    ) -> StorageResult<()> {
        match route {
            KeyRoute::Message {
                session_id,
                message_id,
            } => {
                let mut record: MessageRecord = serde_json::from_value(value)?;
                record.sort_parts();
                self.records
                    .upsert_message(session_id, message_id, &record)
                    .await
            }
            KeyRoute::Session {
                project_id,
                session_id,
            } => {
                if self
                    .records
                    .upsert_session(project_id, session_id, &value)
                    .await?
                {
                    Ok(())
                } else {
                    Err(StorageError::InvalidKey {
                        key: key.joined(),
                        reason: "session belongs to another project".to_string(),
                    })
                }
            }
            KeyRoute::SessionDiff { session_id } => {
                self.records.upsert_diff(session_id, &value).await
            }
            KeyRoute::Messages { .. } | KeyRoute::Sessions { .. } => {
                Err(listing_key(key, "cannot write a collection"))
            }
            KeyRoute::File => Err(StorageError::InvalidKey {
                key: key.joined(),
                reason: "not a record-store key".to_string(),
            }),
        }
    }

    async fn message_ids(&self, session_id: &str) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .records
                .list_messages(session_id, after.as_deref(), LIST_PAGE_SIZE)
                .await?;
            ids.extend(page.ids);
            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(ids),
            }
        }
    }

    async fn session_ids(&self, project_id: &str) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .records
                .list_sessions(project_id, after.as_deref(), LIST_PAGE_SIZE)
                .await?;
            ids.extend(page.ids);
            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(ids),
            }
        }
    }
}

fn listing_key(key: &StorageKey, reason: &str) -> StorageError {
    StorageError::InvalidKey {
        key: key.joined(),
        reason: reason.to_string(),
    }
}

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;

use super::schema;
use super::{MessageRecord, Page, RecordStore, SessionRow, part_id};
use crate::error::{StorageError, StorageResult};

/// [`RecordStore`] backed by a single SQLite connection.
///
/// Every call runs on the blocking pool and holds the connection only for the
/// duration of its statement(s); message writes run in one transaction so the
/// part list is replaced atomically.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub async fn open(path: PathBuf) -> StorageResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> StorageResult<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
            schema::init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Other(format!("Failed to spawn blocking task: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::init_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Other(format!("Task execution failed: {}", e)))?
        .map_err(StorageError::from)
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn to_json(value: &Value) -> Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json(column: usize, raw: &str) -> Result<Value, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Run a paginated id query. Fetches one extra row to decide whether a next
/// page exists.
fn page_ids(
    conn: &Connection,
    sql: &str,
    owner: &str,
    after: Option<&str>,
    limit: usize,
) -> Result<Page, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let fetch = (limit.max(1) + 1) as i64;
    let mut ids = stmt
        .query_map(params![owner, after.unwrap_or(""), fetch], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let next = if ids.len() > limit.max(1) {
        ids.truncate(limit.max(1));
        ids.last().cloned()
    } else {
        None
    };
    Ok(Page { ids, next })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert_session(
        &self,
        project_id: &str,
        session_id: &str,
        data: &Value,
    ) -> StorageResult<bool> {
        let project_id = project_id.to_string();
        let session_id = session_id.to_string();
        let data = data.clone();
        let affected = self
            .run_blocking(move |conn| {
                conn.execute(
                    "INSERT INTO session (id, project_id, data, updated_at) VALUES (?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        data = excluded.data, updated_at = excluded.updated_at
                     WHERE session.project_id = excluded.project_id",
                    params![session_id, project_id, to_json(&data)?, now()],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<SessionRow>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT project_id, data FROM session WHERE id = ?",
                params![session_id],
                |row| {
                    let raw: String = row.get(1)?;
                    Ok(SessionRow {
                        project_id: row.get(0)?,
                        data: from_json(1, &raw)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn remove_session(&self, project_id: &str, session_id: &str) -> StorageResult<bool> {
        let project_id = project_id.to_string();
        let session_id = session_id.to_string();
        let affected = self
            .run_blocking(move |conn| {
                conn.execute(
                    "DELETE FROM session WHERE id = ? AND project_id = ?",
                    params![session_id, project_id],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    async fn list_sessions(
        &self,
        project_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Page> {
        let project_id = project_id.to_string();
        let after = after.map(str::to_string);
        self.run_blocking(move |conn| {
            page_ids(
                conn,
                "SELECT id FROM session WHERE project_id = ? AND id > ? ORDER BY id LIMIT ?",
                &project_id,
                after.as_deref(),
                limit,
            )
        })
        .await
    }

    async fn upsert_message(
        &self,
        session_id: &str,
        message_id: &str,
        record: &MessageRecord,
    ) -> StorageResult<()> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        let mut record = record.clone();
        record.sort_parts();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let ts = now();

            tx.execute(
                "INSERT INTO message (session_id, id, data, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(session_id, id) DO UPDATE SET
                    data = excluded.data, updated_at = excluded.updated_at",
                params![session_id, message_id, to_json(&record.info)?, ts],
            )?;

            tx.execute(
                "DELETE FROM part WHERE session_id = ? AND message_id = ?",
                params![session_id, message_id],
            )?;

            for (position, part) in record.parts.iter().enumerate() {
                let part_type = part.get("type").and_then(Value::as_str);
                tx.execute(
                    "INSERT INTO part (session_id, message_id, position, id, part_type, data)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        session_id,
                        message_id,
                        position as i64,
                        part_id(part),
                        part_type,
                        to_json(part)?
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> StorageResult<Option<MessageRecord>> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let info = conn
                .query_row(
                    "SELECT data FROM message WHERE session_id = ? AND id = ?",
                    params![session_id, message_id],
                    |row| {
                        let raw: String = row.get(0)?;
                        from_json(0, &raw)
                    },
                )
                .optional()?;

            let Some(info) = info else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT data FROM part WHERE session_id = ? AND message_id = ? ORDER BY position",
            )?;
            let parts = stmt
                .query_map(params![session_id, message_id], |row| {
                    let raw: String = row.get(0)?;
                    from_json(0, &raw)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some(MessageRecord { info, parts }))
        })
        .await
    }

    async fn remove_message(&self, session_id: &str, message_id: &str) -> StorageResult<bool> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM part WHERE session_id = ? AND message_id = ?",
                params![session_id, message_id],
            )?;
            let affected = tx.execute(
                "DELETE FROM message WHERE session_id = ? AND id = ?",
                params![session_id, message_id],
            )?;
            tx.commit()?;
            Ok(affected > 0)
        })
        .await
    }

    async fn list_messages(
        &self,
        session_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Page> {
        let session_id = session_id.to_string();
        let after = after.map(str::to_string);
        self.run_blocking(move |conn| {
            page_ids(
                conn,
                "SELECT id FROM message WHERE session_id = ? AND id > ? ORDER BY id LIMIT ?",
                &session_id,
                after.as_deref(),
                limit,
            )
        })
        .await
    }

    async fn upsert_diff(&self, session_id: &str, diffs: &Value) -> StorageResult<()> {
        let session_id = session_id.to_string();
        let diffs = diffs.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO session_diff (session_id, data, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET
                    data = excluded.data, updated_at = excluded.updated_at",
                params![session_id, to_json(&diffs)?, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_diff(&self, session_id: &str) -> StorageResult<Option<Value>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT data FROM session_diff WHERE session_id = ?",
                params![session_id],
                |row| {
                    let raw: String = row.get(0)?;
                    from_json(0, &raw)
                },
            )
            .optional()
        })
        .await
    }

    async fn remove_diff(&self, session_id: &str) -> StorageResult<bool> {
        let session_id = session_id.to_string();
        let affected = self
            .run_blocking(move |conn| {
                conn.execute(
                    "DELETE FROM session_diff WHERE session_id = ?",
                    params![session_id],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    async fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        self.run_blocking(schema::ensure_indexes).await
    }
}

//! Key-addressed session storage.
//!
//! Sessions, messages (with their parts) and per-session diffs live in a
//! relational record store; every other key is a JSON document on disk. A
//! data directory written by older releases is brought forward by an ordered
//! list of layout migrations and a one-time bulk import before the first
//! read or write is served.

pub mod config;
pub mod error;
pub mod file_store;
pub mod key;
pub mod lock;
pub mod migration;
pub mod record;
pub mod storage;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use file_store::FileStore;
pub use key::{KeyRoute, StorageKey};
pub use migration::import::ImportStats;
pub use migration::{Migration, MigrationPipeline, MigrationReport, SkippedMigration};
pub use record::{MessageRecord, Page, RecordStore, SessionRow, SqliteRecordStore};
pub use storage::{Storage, StorageHealth};

//! On-disk layout migrations.
//!
//! Steps run in ascending order starting at the persisted cursor. Every step
//! is attempted exactly once: a step that fails is logged and recorded as
//! skipped, and the cursor still moves past it so one bad step cannot wedge
//! startup.

pub mod import;
pub mod steps;

use async_trait::async_trait;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{StorageError, StorageResult};
use crate::file_store::replace_file;

/// Name of the cursor file inside the data directory.
pub const CURSOR_FILE: &str = "migration";

/// One-shot transformation of the data directory.
///
/// Implementations must detect "nothing to do" themselves; a step can be
/// handed a directory that never had the layout it converts.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, dir: &Path) -> anyhow::Result<()>;
}

/// A step that raised and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMigration {
    pub index: usize,
    pub name: String,
    pub reason: String,
}

impl From<&SkippedMigration> for StorageError {
    fn from(skipped: &SkippedMigration) -> Self {
        StorageError::MigrationStepFailed {
            index: skipped.index,
            name: skipped.name.clone(),
            reason: skipped.reason.clone(),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Cursor found on disk before running.
    pub from: usize,
    /// Cursor persisted after running.
    pub to: usize,
    /// Indexes of steps that completed.
    pub applied: Vec<usize>,
    /// Steps that raised during this run.
    pub skipped: Vec<SkippedMigration>,
}

/// Ordered list of migration steps.
pub struct MigrationPipeline {
    steps: Vec<Box<dyn Migration>>,
}

impl Default for MigrationPipeline {
    fn default() -> Self {
        Self::new(steps::standard())
    }
}

impl MigrationPipeline {
    pub fn new(steps: Vec<Box<dyn Migration>>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step at or past the persisted cursor.
    ///
    /// The cursor is written after each step, so a crash mid-run resumes at the
    /// first step that had not been attempted.
    pub async fn run(&self, dir: &Path) -> StorageResult<MigrationReport> {
        let from = read_cursor(dir).await;
        let mut report = MigrationReport {
            from,
            to: from,
            ..Default::default()
        };

        for (index, step) in self.steps.iter().enumerate().skip(from) {
            info!("Running migration {} ({})", index, step.name());
            match step.run(dir).await {
                Ok(()) => report.applied.push(index),
                Err(e) => {
                    let skipped = SkippedMigration {
                        index,
                        name: step.name().to_string(),
                        reason: format!("{:#}", e),
                    };
                    error!("{}", StorageError::from(&skipped));
                    report.skipped.push(skipped);
                }
            }
            write_cursor(dir, index + 1).await?;
            report.to = index + 1;
        }

        Ok(report)
    }
}

/// Read the persisted cursor; a missing or unreadable file counts as `0`.
pub async fn read_cursor(dir: &Path) -> usize {
    match tokio::fs::read_to_string(dir.join(CURSOR_FILE)).await {
        Ok(content) => content.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

pub async fn write_cursor(dir: &Path, cursor: usize) -> StorageResult<()> {
    replace_file(&dir.join(CURSOR_FILE), cursor.to_string().into_bytes()).await
}

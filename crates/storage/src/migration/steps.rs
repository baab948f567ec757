//! Registered migration steps. Order is significant: a step's index is its
//! position here and is what the cursor counts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

use super::Migration;
use crate::file_store::{replace_file_blocking, scan};
use crate::key::StorageKey;

/// Project id assigned to sessions that never recorded one.
pub const GLOBAL_PROJECT: &str = "global";

pub fn standard() -> Vec<Box<dyn Migration>> {
    vec![Box::new(LegacyProjectLayout), Box::new(SplitSessionDiffs)]
}

/// Flattens the per-project `project/<slug>/storage/session/{info,message,part}`
/// tree into `session/<project>/`, `message/<session>/` and `part/<message>/`.
/// Existing destination files are never overwritten.
pub struct LegacyProjectLayout;

#[async_trait]
impl Migration for LegacyProjectLayout {
    fn name(&self) -> &str {
        "legacy_project_layout"
    }

    async fn run(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || relocate_projects(&dir))
            .await
            .context("legacy layout task panicked")?
    }
}

fn relocate_projects(dir: &Path) -> Result<()> {
    let projects = dir.join("project");
    if !projects.is_dir() {
        debug!("No legacy project directory, nothing to relocate");
        return Ok(());
    }

    let mut moved = 0usize;
    for entry in fs::read_dir(&projects).context("reading legacy project directory")? {
        let entry = entry?;
        let storage = entry.path().join("storage").join("session");
        if !storage.is_dir() {
            continue;
        }

        for key in scan(&storage.join("info"), &StorageKey::default())? {
            let [session_id] = key.segments() else {
                continue;
            };
            let src = storage.join("info").join(key.file_path());
            let Some(mut doc) = read_doc(&src) else {
                continue;
            };
            let project_id = doc
                .get("projectID")
                .and_then(Value::as_str)
                .unwrap_or(GLOBAL_PROJECT)
                .to_string();
            if let Some(obj) = doc.as_object_mut() {
                obj.entry("projectID").or_insert_with(|| json!(project_id));
            }
            let dest = StorageKey::new(["session", project_id.as_str(), session_id.as_str()]);
            moved += write_if_absent(dir, &dest, &doc)? as usize;
        }

        for key in scan(&storage.join("message"), &StorageKey::default())? {
            let [session_id, message_id] = key.segments() else {
                continue;
            };
            let Some(doc) = read_doc(&storage.join("message").join(key.file_path())) else {
                continue;
            };
            let dest = StorageKey::new(["message", session_id.as_str(), message_id.as_str()]);
            moved += write_if_absent(dir, &dest, &doc)? as usize;
        }

        for key in scan(&storage.join("part"), &StorageKey::default())? {
            let [_session_id, message_id, part_id] = key.segments() else {
                continue;
            };
            let Some(doc) = read_doc(&storage.join("part").join(key.file_path())) else {
                continue;
            };
            let dest = StorageKey::new(["part", message_id.as_str(), part_id.as_str()]);
            moved += write_if_absent(dir, &dest, &doc)? as usize;
        }
    }

    info!("Relocated {} legacy documents", moved);
    Ok(())
}

/// Moves `summary.diffs` out of session documents into
/// `session_diff/<session>.json`, leaving aggregate line counts behind.
pub struct SplitSessionDiffs;

#[async_trait]
impl Migration for SplitSessionDiffs {
    fn name(&self) -> &str {
        "split_session_diffs"
    }

    async fn run(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || split_diffs(&dir))
            .await
            .context("session diff task panicked")?
    }
}

fn split_diffs(dir: &Path) -> Result<()> {
    let mut split = 0usize;
    for key in scan(&dir.join("session"), &StorageKey::from(["session"]))? {
        let [_, _project_id, session_id] = key.segments() else {
            continue;
        };
        let path = dir.join(key.file_path());
        let Some(mut doc) = read_doc(&path) else {
            continue;
        };
        let Some(diffs) = doc
            .get_mut("summary")
            .and_then(|summary| summary.get_mut("diffs"))
            .map(Value::take)
        else {
            continue;
        };
        let Value::Array(entries) = &diffs else {
            continue;
        };

        let additions: i64 = entries
            .iter()
            .filter_map(|d| d.get("additions").and_then(Value::as_i64))
            .sum();
        let deletions: i64 = entries
            .iter()
            .filter_map(|d| d.get("deletions").and_then(Value::as_i64))
            .sum();

        let dest = StorageKey::new(["session_diff", session_id.as_str()]);
        write_if_absent(dir, &dest, &diffs)?;

        doc["summary"] = json!({ "additions": additions, "deletions": deletions });
        write_doc(&path, &doc)?;
        split += 1;
    }

    info!("Split diffs out of {} session documents", split);
    Ok(())
}

fn read_doc(path: &Path) -> Option<Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Skipping unreadable document {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!("Skipping malformed document {}: {}", path.display(), e);
            None
        }
    }
}

fn write_doc(path: &Path, doc: &Value) -> Result<()> {
    replace_file_blocking(path, &serde_json::to_vec_pretty(doc)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn write_if_absent(dir: &Path, key: &StorageKey, doc: &Value) -> Result<bool> {
    let path = dir.join(key.file_path());
    if path.exists() {
        return Ok(false);
    }
    write_doc(&path, doc)?;
    Ok(true)
}

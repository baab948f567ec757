//! Undo the changes recorded by a list of patches without clobbering edits
//! made since.
//!
//! Per file, the cheapest safe action wins: leave it alone if it already
//! matches the original snapshot, check it out directly if it still matches
//! the snapshot the patch led to, otherwise reverse-apply the patch with a
//! three-way merge. Anything that cannot be merged cleanly is reported as a
//! conflict and left exactly as it was.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::engine::{Patch, SnapshotEngine, SnapshotHash};
use crate::error::{SnapshotError, SnapshotResult};

/// A file `revert` declined to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevertConflict {
    pub file: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevertReport {
    /// Files rewritten or deleted.
    pub reverted: Vec<PathBuf>,
    /// Files that already matched the original snapshot.
    pub unchanged: Vec<PathBuf>,
    pub conflicts: Vec<RevertConflict>,
}

impl RevertReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilePlan {
    file: PathBuf,
    hash: SnapshotHash,
    to: Option<SnapshotHash>,
}

/// One entry per distinct file, in first-seen order. The first patch naming a
/// file supplies `hash`; the last one supplies `to`.
fn plan(patches: &[Patch]) -> Vec<FilePlan> {
    let mut plans: Vec<FilePlan> = Vec::new();
    let mut seen: HashMap<&Path, usize> = HashMap::new();
    for patch in patches {
        for file in &patch.files {
            match seen.get(file.as_path()) {
                Some(&index) => plans[index].to = patch.to.clone(),
                None => {
                    seen.insert(file.as_path(), plans.len());
                    plans.push(FilePlan {
                        file: file.clone(),
                        hash: patch.hash.clone(),
                        to: patch.to.clone(),
                    });
                }
            }
        }
    }
    plans
}

enum Outcome {
    Reverted,
    Unchanged,
    Conflict(String),
}

impl SnapshotEngine {
    /// Revert every file named by `patches` to its state in the patch's `hash`.
    #[instrument(
        name = "snapshot.revert",
        skip_all,
        fields(project = %self.project.id, patches = patches.len())
    )]
    pub async fn revert(&self, patches: &[Patch]) -> RevertReport {
        let mut report = RevertReport::default();
        if !self.is_enabled() {
            return report;
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        for entry in plan(patches) {
            let outcome = match &entry.to {
                None => self.checkout_or_delete(&entry.hash, &entry.file).await,
                Some(to) => self.revert_between(&entry.hash, to, &entry.file).await,
            };
            match outcome {
                Ok(Outcome::Reverted) => report.reverted.push(entry.file),
                Ok(Outcome::Unchanged) => report.unchanged.push(entry.file),
                Ok(Outcome::Conflict(reason)) => {
                    report.conflicts.push(conflict(entry.file, reason))
                }
                Err(e) => report.conflicts.push(conflict(entry.file, e.to_string())),
            }
        }

        info!(
            "Reverted {} files ({} unchanged, {} conflicts)",
            report.reverted.len(),
            report.unchanged.len(),
            report.conflicts.len()
        );
        report
    }

    /// Check `file` out of `hash`, or delete it if `hash` never had it.
    async fn checkout_or_delete(&self, hash: &str, file: &Path) -> SnapshotResult<Outcome> {
        let rel = self.relative(file);
        let checkout_err = match self.git.run(["checkout", hash, "--", rel.as_str()]).await {
            Ok(_) => {
                debug!("Checked out {} from {}", rel, hash);
                return Ok(Outcome::Reverted);
            }
            Err(e) => e,
        };

        if self.tree_has(hash, &rel).await? {
            return Ok(Outcome::Conflict(format!(
                "present in snapshot but checkout failed: {}",
                checkout_err
            )));
        }
        match tokio::fs::remove_file(file).await {
            Ok(()) => {
                debug!("Deleted {}, absent from {}", rel, hash);
                Ok(Outcome::Reverted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Outcome::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    async fn revert_between(&self, hash: &str, to: &str, file: &Path) -> SnapshotResult<Outcome> {
        let rel = self.relative(file);
        let original = self.version(hash, &rel).await?;
        let target = self.version(to, &rel).await?;
        let on_disk = match tokio::fs::read(file).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if on_disk == original {
            return Ok(Outcome::Unchanged);
        }
        if on_disk == target {
            return self.checkout_or_delete(hash, file).await;
        }
        let (Some(on_disk), Some(_), Some(_)) = (on_disk, &original, &target) else {
            return Ok(Outcome::Conflict(
                "file was created or deleted on one side only".to_string(),
            ));
        };
        self.reverse_merge(hash, to, file, &rel, on_disk).await
    }

    /// Contents of `rel` in `tree`, `None` when the tree has no such file.
    async fn version(&self, tree: &str, rel: &str) -> SnapshotResult<Option<Vec<u8>>> {
        if !self.tree_has(tree, rel).await? {
            return Ok(None);
        }
        self.show(tree, rel).await.map(Some)
    }

    /// Reverse-apply `hash..to` for one file on top of its current contents.
    async fn reverse_merge(
        &self,
        hash: &str,
        to: &str,
        file: &Path,
        rel: &str,
        current: Vec<u8>,
    ) -> SnapshotResult<Outcome> {
        let forward = self
            .git
            .run(["diff", "--no-ext-diff", "--binary", hash, to, "--", rel])
            .await?
            .stdout;
        if forward.is_empty() {
            return Ok(Outcome::Unchanged);
        }

        // `apply --3way` works against the index, which must match the file.
        self.git.run(["add", "--", rel]).await?;
        let applied = self
            .git
            .run_with_stdin(
                ["apply", "--reverse", "--3way", "--whitespace=nowarn"],
                forward,
            )
            .await;

        let merged = tokio::fs::read(file).await.ok();
        let reason = match (&applied, merged.as_deref()) {
            (Err(e), _) => Some(format!("reverse merge failed: {}", e)),
            (Ok(_), None) => Some("file vanished during merge".to_string()),
            (Ok(_), Some(bytes)) if conflict_blocks(bytes) > conflict_blocks(&current) => {
                Some("reverse merge left conflict markers".to_string())
            }
            (Ok(_), Some(_)) => None,
        };

        match reason {
            None => {
                debug!("Reverse-merged {} ({}..{})", rel, hash, to);
                Ok(Outcome::Reverted)
            }
            Some(reason) => {
                tokio::fs::write(file, &current).await?;
                // Leave the shadow index as it was before the attempt.
                if let Err(e) = self.git.run(["add", "--", rel]).await {
                    debug!("Could not re-stage {}: {}", rel, e);
                }
                Ok(Outcome::Conflict(reason))
            }
        }
    }
}

fn conflict(file: PathBuf, reason: String) -> RevertConflict {
    warn!(
        "{}",
        SnapshotError::RevertConflict {
            path: file.clone(),
            reason: reason.clone(),
        }
    );
    RevertConflict { file, reason }
}

/// Number of `<<<<<<<` ... `>>>>>>>` blocks in `bytes`.
fn conflict_blocks(bytes: &[u8]) -> usize {
    let text = String::from_utf8_lossy(bytes);
    let mut opened = false;
    let mut blocks = 0;
    for line in text.lines() {
        if line.starts_with("<<<<<<<") {
            opened = true;
        } else if opened && line.starts_with(">>>>>>>") {
            opened = false;
            blocks += 1;
        }
    }
    blocks
}

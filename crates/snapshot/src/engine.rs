//! Per-project checkpoint engine over a shadow git repository.
//!
//! Snapshots are tree objects written from the shadow repository's index; no
//! commits or refs are created, so the project's own history is never touched
//! and unreferenced trees are eventually pruned by `git gc`.

use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use crate::config::SnapshotConfig;
use crate::coordinator::RepoCoordinator;
use crate::error::SnapshotResult;
use crate::git::Git;
use crate::project::Project;
use crate::scheduler::{ScheduledJob, Scheduler};

/// Git tree id of a snapshot.
pub type SnapshotHash = String;

/// Identifier under which every engine registers its cleanup job.
pub const CLEANUP_JOB_ID: &str = "snapshot.cleanup";

/// Files that differ between `hash` and either the working tree or `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub hash: SnapshotHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SnapshotHash>,
    /// Absolute paths.
    pub files: Vec<PathBuf>,
}

impl Patch {
    pub fn new(hash: impl Into<SnapshotHash>, files: Vec<PathBuf>) -> Self {
        Self {
            hash: hash.into(),
            to: None,
            files,
        }
    }

    pub fn with_to(mut self, to: impl Into<SnapshotHash>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// Before/after contents of one file between two snapshots.
///
/// Binary files carry empty contents and zero counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path relative to the project root.
    pub file: String,
    pub before: String,
    pub after: String,
    pub additions: u64,
    pub deletions: u64,
}

pub struct SnapshotEngine {
    pub(crate) project: Project,
    pub(crate) config: SnapshotConfig,
    pub(crate) coordinator: Arc<RepoCoordinator>,
    pub(crate) shadow: PathBuf,
    pub(crate) git: Git,
}

impl SnapshotEngine {
    pub fn new(project: Project, config: SnapshotConfig, coordinator: Arc<RepoCoordinator>) -> Self {
        let shadow = config.shadow_dir(&project.id);
        let git = Git::shadow(&shadow, &project.worktree);
        Self {
            project,
            config,
            coordinator,
            shadow,
            git,
        }
    }

    /// Engine for the project containing `dir`.
    pub async fn for_directory(
        dir: &Path,
        config: SnapshotConfig,
        coordinator: Arc<RepoCoordinator>,
    ) -> Self {
        Self::new(Project::detect(dir).await, config, coordinator)
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn shadow_dir(&self) -> &Path {
        &self.shadow
    }

    /// Snapshots are taken only for git projects with snapshots enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.project.is_git()
    }

    /// Record the current working tree and return its snapshot hash.
    ///
    /// `Ok(None)` means snapshots are disabled for this project; `Err` means
    /// git failed.
    #[instrument(name = "snapshot.track", skip(self), fields(project = %self.project.id))]
    pub async fn track(&self) -> SnapshotResult<Option<SnapshotHash>> {
        if !self.is_enabled() {
            debug!(
                "Snapshots disabled for {}, not tracking",
                self.project.worktree.display()
            );
            return Ok(None);
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        self.write_snapshot().await.map(Some).inspect_err(|e| {
            warn!(
                "Snapshot of {} failed: {}",
                self.project.worktree.display(),
                e
            )
        })
    }

    async fn write_snapshot(&self) -> SnapshotResult<SnapshotHash> {
        self.ensure_repo().await?;
        self.inline_gc().await;
        self.stage().await?;
        let hash = self.git.run(["write-tree"]).await?.stdout_text().trim().to_string();
        debug!("Tracked {} as {}", self.project.worktree.display(), hash);
        Ok(hash)
    }

    /// Files changed since `hash`. Empty when the diff cannot be computed.
    #[instrument(name = "snapshot.patch", skip(self), fields(project = %self.project.id))]
    pub async fn patch(&self, hash: &str) -> Patch {
        let mut patch = Patch::new(hash, Vec::new());
        if !self.is_enabled() {
            return patch;
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        match self.changed_files(hash).await {
            Ok(files) => patch.files = files,
            Err(e) => warn!("Failed to compute changes since {}: {}", hash, e),
        }
        patch
    }

    async fn changed_files(&self, hash: &str) -> SnapshotResult<Vec<PathBuf>> {
        self.stage().await?;
        let out = self
            .git
            .run(["diff", "--no-ext-diff", "--name-only", "-z", hash, "--", "."])
            .await?;
        Ok(out
            .nul_entries()
            .into_iter()
            .map(|file| self.project.worktree.join(file))
            .collect())
    }

    /// Rewrite every file recorded in `hash`. Files created after the snapshot
    /// are left alone.
    #[instrument(name = "snapshot.restore", skip(self), fields(project = %self.project.id))]
    pub async fn restore(&self, hash: &str) {
        if !self.is_enabled() {
            return;
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        let restored = async {
            self.git.run(["read-tree", hash]).await?;
            self.git.run(["checkout-index", "-a", "-f"]).await
        }
        .await;
        match restored {
            Ok(_) => info!("Restored {} to {}", self.project.worktree.display(), hash),
            Err(e) => warn!("Failed to restore snapshot {}: {}", hash, e),
        }
    }

    /// Unified diff between `hash` and the working tree. Empty on failure.
    #[instrument(name = "snapshot.diff", skip(self), fields(project = %self.project.id))]
    pub async fn diff(&self, hash: &str) -> String {
        if !self.is_enabled() {
            return String::new();
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        let diff = async {
            self.stage().await?;
            self.git
                .run(["diff", "--no-ext-diff", hash, "--", "."])
                .await
                .map(|out| out.stdout_text())
        }
        .await;
        diff.unwrap_or_else(|e| {
            warn!("Failed to diff against {}: {}", hash, e);
            String::new()
        })
    }

    /// Per-file contents and line counts between two snapshots.
    #[instrument(name = "snapshot.diff_full", skip(self), fields(project = %self.project.id))]
    pub async fn diff_full(&self, from: &str, to: &str) -> Vec<FileDiff> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        self.file_diffs(from, to).await.unwrap_or_else(|e| {
            warn!("Failed to diff {}..{}: {}", from, to, e);
            Vec::new()
        })
    }

    async fn file_diffs(&self, from: &str, to: &str) -> SnapshotResult<Vec<FileDiff>> {
        let out = self
            .git
            .run([
                "diff",
                "--no-ext-diff",
                "--no-renames",
                "--numstat",
                "-z",
                from,
                to,
                "--",
                ".",
            ])
            .await?;

        let mut diffs = Vec::new();
        // Without renames every `-z` entry is `added\tdeleted\tpath`, path unquoted.
        for entry in out.nul_entries() {
            let Some(stat) = NumStat::parse(&entry) else {
                debug!("Unparseable numstat entry: {:?}", entry);
                continue;
            };
            let diff = match stat.counts {
                None => FileDiff {
                    file: stat.file,
                    ..Default::default()
                },
                Some((additions, deletions)) => FileDiff {
                    before: self.show_text(from, &stat.file).await,
                    after: self.show_text(to, &stat.file).await,
                    file: stat.file,
                    additions,
                    deletions,
                },
            };
            diffs.push(diff);
        }
        Ok(diffs)
    }

    /// Contents of `file` in `tree`, empty when absent.
    async fn show_text(&self, tree: &str, file: &str) -> String {
        match self.show(tree, file).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }

    pub(crate) async fn show(&self, tree: &str, file: &str) -> SnapshotResult<Vec<u8>> {
        let spec = format!("{}:{}", tree, file);
        Ok(self.git.run(["show", spec.as_str()]).await?.stdout)
    }

    pub(crate) async fn tree_has(&self, tree: &str, file: &str) -> SnapshotResult<bool> {
        let out = self.git.run(["ls-tree", tree, "--", file]).await?;
        Ok(!out.stdout.is_empty())
    }

    /// Prune unreachable objects older than the cleanup window.
    #[instrument(name = "snapshot.cleanup", skip(self), fields(project = %self.project.id))]
    pub async fn cleanup(&self) {
        if !self.is_enabled() {
            return;
        }

        let _guard = self.coordinator.lock(&self.shadow).await;
        if !self.shadow.exists() {
            return;
        }
        self.gc(&self.config.gc.prune).await;
        self.coordinator.mark_gc(&self.shadow);
    }

    /// Scheduled job running [`SnapshotEngine::cleanup`]. The job holds a weak
    /// reference, so it turns into a no-op once the engine is dropped.
    pub fn cleanup_job(self: &Arc<Self>) -> ScheduledJob {
        let engine = Arc::downgrade(self);
        ScheduledJob {
            id: CLEANUP_JOB_ID.to_string(),
            interval: self.config.gc.cleanup_interval(),
            scope: self.project.worktree.display().to_string(),
            run: Arc::new(move || {
                let engine = engine.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.cleanup().await;
                    }
                }
                .boxed()
            }),
        }
    }

    pub fn schedule_cleanup(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        scheduler.register(self.cleanup_job());
    }

    /// Caller holds the repository lock.
    async fn inline_gc(&self) {
        if self
            .coordinator
            .claim_gc(&self.shadow, self.config.gc.inline_interval())
        {
            self.gc(&self.config.gc.inline_prune).await;
        }
    }

    async fn gc(&self, prune: &str) {
        let prune = format!("--prune={}", prune);
        match self.git.run(["gc", "--quiet", prune.as_str()]).await {
            Ok(_) => debug!("Collected {} ({})", self.shadow.display(), prune),
            Err(e) => warn!("gc of {} failed: {}", self.shadow.display(), e),
        }
    }

    /// Create the shadow repository on first use.
    async fn ensure_repo(&self) -> SnapshotResult<()> {
        if tokio::fs::try_exists(&self.shadow).await? {
            return Ok(());
        }
        if let Some(parent) = self.shadow.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.git.run(["init", "--quiet"]).await?;
        self.git.run(["config", "core.autocrlf", "false"]).await?;
        info!(
            "Initialized snapshot repository {} for {}",
            self.shadow.display(),
            self.project.worktree.display()
        );
        Ok(())
    }

    /// Mirror the project's local excludes so the shadow repository ignores the
    /// same files the project does.
    async fn sync_excludes(&self) -> SnapshotResult<()> {
        let source = self.project.worktree.join(".git").join("info").join("exclude");
        let content = tokio::fs::read(&source).await.unwrap_or_default();
        let target = self.shadow.join("info").join("exclude");
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    /// Bring the shadow index in line with the working tree.
    pub(crate) async fn stage(&self) -> SnapshotResult<()> {
        self.sync_excludes().await?;
        let listed = self
            .git
            .run([
                "ls-files",
                "--others",
                "--modified",
                "--deleted",
                "--exclude-standard",
                "-z",
            ])
            .await?;
        let mut paths = listed.nul_entries();
        paths.sort();
        // Deleted files are reported as both modified and deleted.
        paths.dedup();
        if paths.is_empty() {
            return Ok(());
        }

        debug!("Staging {} changed paths", paths.len());
        if paths.len() < self.config.bulk_add_threshold {
            let mut args: Vec<OsString> = ["add", "--all", "--"].map(OsString::from).into();
            args.extend(paths.into_iter().map(OsString::from));
            self.git.run(args).await?;
        } else {
            let mut input = Vec::new();
            for path in &paths {
                input.extend_from_slice(path.as_bytes());
                input.push(0);
            }
            self.git
                .run_with_stdin(
                    [
                        "add",
                        "--all",
                        "--pathspec-from-file=-",
                        "--pathspec-file-nul",
                    ],
                    input,
                )
                .await?;
        }
        Ok(())
    }

    /// `file` relative to the project root, as git expects it.
    pub(crate) fn relative(&self, file: &Path) -> String {
        file.strip_prefix(&self.project.worktree)
            .unwrap_or(file)
            .to_string_lossy()
            .into_owned()
    }
}

/// One entry of `git diff --numstat -z`.
#[derive(Debug, PartialEq, Eq)]
struct NumStat {
    /// `None` for binary files.
    counts: Option<(u64, u64)>,
    file: String,
}

impl NumStat {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(3, '\t');
        let added = fields.next()?;
        let deleted = fields.next()?;
        let file = fields.next()?.to_string();
        if added == "-" || deleted == "-" {
            return Some(Self { counts: None, file });
        }
        Some(Self {
            counts: Some((added.parse().ok()?, deleted.parse().ok()?)),
            file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_numstat_lines() {
        assert_eq!(
            NumStat::parse("3\t1\tsrc/main.rs"),
            Some(NumStat {
                counts: Some((3, 1)),
                file: "src/main.rs".to_string()
            })
        );
        assert_eq!(
            NumStat::parse("-\t-\tlogo.png"),
            Some(NumStat {
                counts: None,
                file: "logo.png".to_string()
            })
        );
        assert_eq!(
            NumStat::parse("1\t2\twith\ttab"),
            Some(NumStat {
                counts: Some((1, 2)),
                file: "with\ttab".to_string()
            })
        );
        assert_eq!(NumStat::parse("garbage"), None);
    }

    #[tokio::test]
    async fn non_git_project_is_inert() {
        let dir = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(
            Project::global(dir.path()),
            SnapshotConfig::with_data_dir(data.path()),
            Arc::new(RepoCoordinator::new()),
        );

        assert!(!engine.is_enabled());
        assert_eq!(engine.track().await.unwrap(), None);
        assert!(engine.patch("deadbeef").await.files.is_empty());
        assert_eq!(engine.diff("deadbeef").await, "");
        assert!(engine.diff_full("a", "b").await.is_empty());
        engine.cleanup().await;
        assert!(!engine.shadow_dir().exists());
    }

    #[test]
    fn relative_strips_worktree() {
        let engine = SnapshotEngine::new(
            Project::new("p", "/work/app", None),
            SnapshotConfig::with_data_dir("/tmp/wp"),
            Arc::new(RepoCoordinator::new()),
        );
        assert_eq!(engine.relative(Path::new("/work/app/src/lib.rs")), "src/lib.rs");
        assert_eq!(engine.relative(Path::new("other/file.rs")), "other/file.rs");
    }
}

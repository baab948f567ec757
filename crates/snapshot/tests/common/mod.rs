#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use waypoint_snapshot::{Project, RepoCoordinator, SnapshotConfig, SnapshotEngine};

/// A git project with one commit plus a separate snapshot data directory.
pub struct Fixture {
    pub project: TempDir,
    pub data: TempDir,
}

impl Fixture {
    pub fn new(seed: &str) -> Self {
        waypoint_utils::setup_logging("waypoint-snapshot-tests");
        let project = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        git(project.path(), &["init", "--quiet"]);
        fs::write(project.path().join("README.md"), format!("# {seed}\n")).unwrap();
        git(project.path(), &["add", "README.md"]);
        git(
            project.path(),
            &[
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "commit",
                "--quiet",
                "-m",
                seed,
            ],
        );
        Self { project, data }
    }

    pub fn root(&self) -> &Path {
        self.project.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.project.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: impl AsRef<[u8]>) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    pub fn config(&self) -> SnapshotConfig {
        SnapshotConfig::with_data_dir(self.data.path())
    }

    pub async fn engine(&self, coordinator: Arc<RepoCoordinator>) -> SnapshotEngine {
        self.engine_with(self.config(), coordinator).await
    }

    pub async fn engine_with(
        &self,
        config: SnapshotConfig,
        coordinator: Arc<RepoCoordinator>,
    ) -> SnapshotEngine {
        let project = Project::detect(self.root()).await;
        assert!(project.is_git(), "fixture must be a git project");
        SnapshotEngine::new(project, config, coordinator)
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git must be installed");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// `count` numbered lines, with `overrides` replacing selected ones (1-based).
pub fn lines(count: usize, overrides: &[(usize, &str)]) -> String {
    (1..=count)
        .map(|n| {
            let line = overrides
                .iter()
                .find(|(at, _)| *at == n)
                .map(|(_, text)| text.to_string())
                .unwrap_or_else(|| format!("line {n}"));
            format!("{line}\n")
        })
        .collect()
}

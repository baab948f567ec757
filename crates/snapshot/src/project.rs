//! Project identity used to key shadow repositories.

use log::debug;
use std::path::{Path, PathBuf};

use crate::git::Git;

/// Id shared by every directory that is not inside a git repository with history.
pub const GLOBAL_PROJECT: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vcs {
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Root commit of the repository. Outside git this is [`GLOBAL_PROJECT`];
    /// a repository without commits gets `global-<hash of its path>`.
    pub id: String,
    pub worktree: PathBuf,
    pub vcs: Option<Vcs>,
}

impl Project {
    pub fn new(id: impl Into<String>, worktree: impl Into<PathBuf>, vcs: Option<Vcs>) -> Self {
        Self {
            id: id.into(),
            worktree: worktree.into(),
            vcs,
        }
    }

    /// Project for a directory without version control.
    pub fn global(dir: impl Into<PathBuf>) -> Self {
        Self::new(GLOBAL_PROJECT, dir, None)
    }

    /// Resolve the project containing `dir`.
    ///
    /// The id is the repository's root commit, so clones and worktrees of the
    /// same history share one shadow repository. Never fails: a directory
    /// outside git maps to [`Project::global`].
    pub async fn detect(dir: &Path) -> Self {
        let toplevel = match Git::discover(dir)
            .run(["rev-parse", "--show-toplevel"])
            .await
        {
            Ok(out) => match out.lines().into_iter().next() {
                Some(line) => PathBuf::from(line),
                None => return Self::global(dir),
            },
            Err(e) => {
                debug!("{} is not inside a git repository: {}", dir.display(), e);
                return Self::global(dir);
            }
        };

        let roots = Git::discover(&toplevel)
            .run(["rev-list", "--max-parents=0", "--all"])
            .await
            .map(|out| out.lines())
            .unwrap_or_default();
        // Several roots after unrelated-history merges; pick a stable one.
        let id = match roots.into_iter().min() {
            Some(root) => root,
            None => unborn_id(&toplevel).await,
        };

        Self::new(id, toplevel, Some(Vcs::Git))
    }

    pub fn is_git(&self) -> bool {
        self.vcs == Some(Vcs::Git)
    }
}

/// Id for a repository without commits, keyed by its location so unrelated
/// fresh repositories never share a shadow repository.
async fn unborn_id(toplevel: &Path) -> String {
    let path = toplevel.to_string_lossy().into_owned().into_bytes();
    match Git::discover(toplevel)
        .run_with_stdin(["hash-object", "--stdin"], path)
        .await
    {
        Ok(out) => match out.lines().into_iter().next() {
            Some(hash) => format!("{}-{}", GLOBAL_PROJECT, hash),
            None => GLOBAL_PROJECT.to_string(),
        },
        Err(e) => {
            debug!("Could not hash {}: {}", toplevel.display(), e);
            GLOBAL_PROJECT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn plain_directory_is_global() {
        let dir = TempDir::new().unwrap();
        let project = Project::detect(dir.path()).await;
        assert_eq!(project, Project::global(dir.path()));
        assert!(!project.is_git());
    }

    #[tokio::test]
    async fn repositories_without_commits_get_distinct_ids() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        for dir in [&first, &second] {
            Git::discover(dir.path())
                .run(["init", "--quiet"])
                .await
                .unwrap();
        }

        let a = Project::detect(first.path()).await;
        let b = Project::detect(second.path()).await;
        assert!(a.is_git() && b.is_git());
        assert!(a.id.starts_with("global-"), "{}", a.id);
        assert_ne!(a.id, b.id);
        assert_eq!(Project::detect(first.path()).await.id, a.id);
    }
}

//! Thin async wrapper around the `git` executable.
//!
//! Every invocation disables CRLF conversion and path quoting so that file
//! names and contents round-trip byte for byte. A [`Git`] bound to a shadow
//! repository passes `--git-dir`/`--work-tree` explicitly and never touches the
//! project's own `.git`, and treats every pathspec as a literal path.

use log::trace;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{SnapshotError, SnapshotResult};

/// Captured result of a finished git process.
#[derive(Debug)]
pub struct GitOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Non-empty stdout lines, trailing whitespace removed.
    pub fn lines(&self) -> Vec<String> {
        self.stdout_text()
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// NUL-separated stdout entries (`-z` output).
    pub fn nul_entries(&self) -> Vec<String> {
        self.stdout
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect()
    }

    fn check(self, command: &str) -> SnapshotResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(SnapshotError::CommandFailed {
            command: command.to_string(),
            status: self.status.to_string(),
            stdout: String::from_utf8_lossy(&self.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    git_dir: Option<PathBuf>,
    work_tree: PathBuf,
}

impl Git {
    /// Operate on `git_dir` with `work_tree` as its working tree.
    pub fn shadow(git_dir: impl Into<PathBuf>, work_tree: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: Some(git_dir.into()),
            work_tree: work_tree.into(),
        }
    }

    /// Operate on whatever repository contains `dir`, using git's own discovery.
    pub fn discover(dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: None,
            work_tree: dir.into(),
        }
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(["-c", "core.autocrlf=false", "-c", "core.quotepath=false"]);
        if let Some(git_dir) = &self.git_dir {
            cmd.arg("--git-dir")
                .arg(git_dir)
                .arg("--work-tree")
                .arg(&self.work_tree)
                .env("GIT_LITERAL_PATHSPECS", "1");
        }
        cmd.args(args)
            .current_dir(&self.work_tree)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run git and capture its output without checking the exit status.
    pub async fn output<I, S>(&self, args: I) -> SnapshotResult<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = collect_args(args);
        self.spawn(&args, None).await
    }

    /// Run git, failing with [`SnapshotError::CommandFailed`] on a non-zero exit.
    pub async fn run<I, S>(&self, args: I) -> SnapshotResult<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = collect_args(args);
        self.spawn(&args, None).await?.check(&describe(&args))
    }

    /// Like [`Git::run`], feeding `input` on stdin.
    pub async fn run_with_stdin<I, S>(&self, args: I, input: Vec<u8>) -> SnapshotResult<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = collect_args(args);
        self.spawn(&args, Some(input)).await?.check(&describe(&args))
    }

    async fn spawn(&self, args: &[OsString], input: Option<Vec<u8>>) -> SnapshotResult<GitOutput> {
        let command = describe(args);
        trace!("git {}", command);

        let mut cmd = self.command(args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let spawn_err = |source| SnapshotError::Spawn {
            command: command.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        // Feed stdin from its own task so a full stdout pipe cannot deadlock us.
        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        let output = child.wait_with_output().await.map_err(spawn_err)?;
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // git may exit before draining stdin; its exit status tells the story.
                Ok(Err(e)) => trace!("git {} closed stdin early: {}", command, e),
                Err(e) => trace!("stdin writer for git {} panicked: {}", command, e),
            }
        }

        Ok(GitOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn collect_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter().map(|a| a.as_ref().to_os_string()).collect()
}

fn describe(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn run_reports_failure_with_stderr() {
        let dir = TempDir::new().unwrap();
        let git = Git::shadow(dir.path().join("missing.git"), dir.path());
        let err = git.run(["rev-parse", "HEAD"]).await.unwrap_err();
        match err {
            SnapshotError::CommandFailed {
                command, stderr, ..
            } => {
                assert_eq!(command, "rev-parse HEAD");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let dir = TempDir::new().unwrap();
        let git_dir = dir.path().join("repo.git");
        Git::discover(dir.path())
            .run([OsStr::new("init"), OsStr::new("--quiet"), git_dir.as_os_str()])
            .await
            .unwrap();

        let git = Git::shadow(&git_dir, dir.path());
        let out = git
            .run_with_stdin(["hash-object", "--stdin"], b"hello\n".to_vec())
            .await
            .unwrap();
        // Well-known blob id of "hello\n".
        assert_eq!(out.lines(), vec!["ce013625030ba8dba906f756967f9e9ca394464a"]);
    }

    #[test]
    fn nul_entries_skip_empty() {
        let out = GitOutput {
            status: std::process::ExitStatus::default(),
            stdout: b"a b\0c\0".to_vec(),
            stderr: Vec::new(),
        };
        assert_eq!(out.nul_entries(), vec!["a b", "c"]);
    }
}

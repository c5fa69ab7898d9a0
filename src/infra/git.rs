//! Git command-line adapter used to materialize historical file revisions.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::ConversionError;

pub const DEFAULT_GIT_PROGRAM: &str = "git";

/// Version-control operations the materializer relies on.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Root of the repository containing `dir`.
    async fn repository_root(&self, dir: &Path) -> Result<PathBuf, ConversionError>;

    /// Commit id of the current head of `root`.
    async fn resolve_head(&self, root: &Path) -> Result<String, ConversionError>;

    /// Clone `root` into `scratch` without a checkout, then check out only
    /// `relative` at `revision`. Returns the path of the file inside the clone.
    async fn checkout_path(
        &self,
        root: &Path,
        revision: &str,
        relative: &Path,
        scratch: &TempDir,
    ) -> Result<PathBuf, ConversionError>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitCli {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    async fn git<I, S>(&self, args: I) -> std::io::Result<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let started_at = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = command.output().await?;
        let result = GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        debug!(
            target = "infra::git",
            op = "git::run",
            command = ?command.as_std(),
            success = result.success,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "git command finished"
        );
        Ok(result)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_GIT_PROGRAM))
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn repository_root(&self, dir: &Path) -> Result<PathBuf, ConversionError> {
        let output = self
            .git([
                OsStr::new("-C"),
                dir.as_os_str(),
                OsStr::new("rev-parse"),
                OsStr::new("--show-toplevel"),
            ])
            .await
            .map_err(|err| ConversionError::repository_root_not_found(dir, err.to_string()))?;
        if !output.success || output.stdout.is_empty() {
            warn!(
                target = "infra::git",
                op = "git::repository_root",
                result = "error",
                dir = %dir.display(),
                stderr = %output.stderr,
                "Could not determine repository root"
            );
            return Err(ConversionError::repository_root_not_found(
                dir,
                output.stderr,
            ));
        }
        Ok(PathBuf::from(output.stdout))
    }

    async fn resolve_head(&self, root: &Path) -> Result<String, ConversionError> {
        let output = self
            .git([
                OsStr::new("-C"),
                root.as_os_str(),
                OsStr::new("rev-parse"),
                OsStr::new("HEAD"),
            ])
            .await
            .map_err(|err| ConversionError::checkout_failed(root, "HEAD", err.to_string()))?;
        if !output.success || output.stdout.is_empty() {
            return Err(ConversionError::checkout_failed(root, "HEAD", output.stderr));
        }
        Ok(output.stdout)
    }

    async fn checkout_path(
        &self,
        root: &Path,
        revision: &str,
        relative: &Path,
        scratch: &TempDir,
    ) -> Result<PathBuf, ConversionError> {
        let clone_dir = scratch.path();
        let checkout_failed =
            |detail: String| ConversionError::checkout_failed(relative, revision, detail);

        let clone = self
            .git([
                OsStr::new("clone"),
                OsStr::new("--quiet"),
                OsStr::new("--no-checkout"),
                root.as_os_str(),
                clone_dir.as_os_str(),
            ])
            .await
            .map_err(|err| checkout_failed(err.to_string()))?;
        if !clone.success {
            return Err(checkout_failed(clone.stderr));
        }

        let pathspec = git_pathspec(relative);
        let commit = self
            .git([
                OsStr::new("-C"),
                clone_dir.as_os_str(),
                OsStr::new("rev-parse"),
                OsStr::new("--verify"),
                OsStr::new("--quiet"),
                OsStr::new(&format!("{revision}^{{commit}}")),
            ])
            .await
            .map_err(|err| checkout_failed(err.to_string()))?;
        if !commit.success {
            return Err(checkout_failed(format!("unknown revision `{revision}`")));
        }

        let exists = self
            .git([
                OsStr::new("-C"),
                clone_dir.as_os_str(),
                OsStr::new("cat-file"),
                OsStr::new("-e"),
                OsStr::new(&format!("{}:{pathspec}", commit.stdout)),
            ])
            .await
            .map_err(|err| checkout_failed(err.to_string()))?;
        if !exists.success {
            return Err(ConversionError::file_not_found_at_revision(
                relative, revision,
            ));
        }

        let checkout = self
            .git([
                OsStr::new("-C"),
                clone_dir.as_os_str(),
                OsStr::new("checkout"),
                OsStr::new("--quiet"),
                OsStr::new(&commit.stdout),
                OsStr::new("--"),
                OsStr::new(&pathspec),
            ])
            .await
            .map_err(|err| checkout_failed(err.to_string()))?;
        if !checkout.success {
            return Err(checkout_failed(checkout.stderr));
        }

        let checked_out = clone_dir.join(relative);
        if !tokio::fs::try_exists(&checked_out).await.unwrap_or(false) {
            return Err(ConversionError::file_not_found_at_revision(
                relative, revision,
            ));
        }
        Ok(checked_out)
    }
}

/// Repository-relative path in the `/`-separated form git expects.
fn git_pathspec(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pathspec_uses_forward_slashes() {
        let relative: PathBuf = ["Source", "Sub VIs", "Helper.vi"].iter().collect();
        assert_eq!(git_pathspec(&relative), "Source/Sub VIs/Helper.vi");
    }

    #[tokio::test]
    async fn root_lookup_outside_repository_names_directory() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("not-a-dir");
        let err = GitCli::default()
            .repository_root(&missing)
            .await
            .expect_err("no repository");
        match err {
            ConversionError::RepositoryRootNotFound { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Turns a [`FileReference`] into a real path the renderer can open.

use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use tempfile::{TempDir, TempPath};
use tracing::{debug, info, warn};

use crate::{
    domain::{
        ConversionError, FileReference, Revision,
        reference::extension_of,
    },
    infra::git::VersionControl,
};

/// Shown to the user whenever rendered bytes do not come from the file on disk.
pub const STAGING_WARNING: &str =
    "VI is being read from bytes outside of environment. Rendering may be affected.";

const STAGED_PREFIX: &str = "gpreview-";
const CHECKOUT_PREFIX: &str = "gpreview-gitfs-";
const STAGED_RANDOM_BYTES: usize = 16;

/// A real filesystem path holding the bytes to render.
#[derive(Debug)]
pub enum MaterializedFile {
    /// The caller's own file; never deleted.
    OnDisk { path: PathBuf },
    /// A temp copy of in-memory bytes, deleted on cleanup or drop.
    Staged { path: TempPath },
    /// A file inside a temporary clone; the whole clone is deleted on cleanup or drop.
    Checkout { path: PathBuf, clone: TempDir },
}

impl MaterializedFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::OnDisk { path } => path,
            Self::Staged { path } => path,
            Self::Checkout { path, .. } => path,
        }
    }

    /// User-visible warning attached to this materialization, if any.
    pub fn warning(&self) -> Option<&'static str> {
        match self {
            Self::Staged { .. } => Some(STAGING_WARNING),
            Self::OnDisk { .. } | Self::Checkout { .. } => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        !matches!(self, Self::OnDisk { .. })
    }

    /// Delete whatever this materialization created.
    pub fn cleanup(self) -> io::Result<()> {
        match self {
            Self::OnDisk { .. } => Ok(()),
            Self::Staged { path } => path.close(),
            Self::Checkout { clone, .. } => clone.close(),
        }
    }
}

#[derive(Clone)]
pub struct Materializer {
    staging_dir: PathBuf,
    vcs: Arc<dyn VersionControl>,
}

impl Materializer {
    pub fn new(staging_dir: PathBuf, vcs: Arc<dyn VersionControl>) -> Self {
        Self { staging_dir, vcs }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Whether `bytes` are exactly what currently sits at `path`.
    pub async fn bytes_match_on_disk(path: &Path, bytes: &[u8]) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() == bytes.len() as u64 => {}
            _ => return false,
        }
        match tokio::fs::read(path).await {
            Ok(on_disk) => on_disk == bytes,
            Err(_) => false,
        }
    }

    pub async fn materialize(
        &self,
        reference: &FileReference,
    ) -> Result<MaterializedFile, ConversionError> {
        match reference {
            FileReference::Local { path, buffer: None } => {
                match tokio::fs::metadata(path).await {
                    Ok(metadata) if metadata.is_file() => {
                        Ok(MaterializedFile::OnDisk { path: path.clone() })
                    }
                    Ok(_) => Err(ConversionError::staging(
                        path,
                        io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
                    )),
                    Err(err) => Err(ConversionError::staging(path, err)),
                }
            }
            FileReference::Local {
                path,
                buffer: Some(bytes),
            } => {
                if Self::bytes_match_on_disk(path, bytes).await {
                    debug!(
                        target = "application::materialize",
                        op = "materialize::local",
                        result = "on_disk",
                        path = %path.display(),
                        "Buffer matches disk; rendering file in place"
                    );
                    return Ok(MaterializedFile::OnDisk { path: path.clone() });
                }
                self.stage(path, bytes, extension_of(path))
            }
            FileReference::Virtual {
                locator,
                extension,
                contents,
            } => self.stage(Path::new(locator), contents, extension),
            FileReference::Historical { path, revision } => {
                let Some(revision) = revision else {
                    return Err(ConversionError::revision_missing(path));
                };
                self.checkout(path, revision).await
            }
        }
    }

    fn stage(
        &self,
        source: &Path,
        bytes: &Bytes,
        extension: &str,
    ) -> Result<MaterializedFile, ConversionError> {
        let suffix = format!(".{extension}");
        let mut file = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .suffix(&suffix)
            .rand_bytes(STAGED_RANDOM_BYTES)
            .tempfile_in(&self.staging_dir)
            .map_err(|err| ConversionError::staging(source, err))?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|err| ConversionError::staging(source, err))?;
        let path = file.into_temp_path();

        metrics::counter!("gpreview_staged_files_total").increment(1);
        warn!(
            target = "application::materialize",
            op = "materialize::stage",
            result = "staged",
            source = %source.display(),
            staged = %path.display(),
            bytes = bytes.len(),
            "{STAGING_WARNING}"
        );

        Ok(MaterializedFile::Staged { path })
    }

    async fn checkout(
        &self,
        path: &Path,
        revision: &Revision,
    ) -> Result<MaterializedFile, ConversionError> {
        let (dir, file_name) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => (dir, name),
            _ => {
                return Err(ConversionError::repository_root_not_found(
                    path,
                    "path has no parent directory",
                ));
            }
        };
        let dir = tokio::fs::canonicalize(dir)
            .await
            .map_err(|err| ConversionError::repository_root_not_found(path, err.to_string()))?;

        let root = self
            .vcs
            .repository_root(&dir)
            .await
            .map_err(|err| rename_path(err, path))?;
        let root = match tokio::fs::canonicalize(&root).await {
            Ok(canonical) => canonical,
            Err(_) => root,
        };

        let relative = dir
            .join(file_name)
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                ConversionError::repository_root_not_found(
                    path,
                    format!("file lies outside repository `{}`", root.display()),
                )
            })?;

        let commit = match revision {
            Revision::WorkingCopy => self
                .vcs
                .resolve_head(&root)
                .await
                .map_err(|err| rename_path(err, path))?,
            Revision::Commit(commit) => commit.clone(),
        };

        let clone = tempfile::Builder::new()
            .prefix(CHECKOUT_PREFIX)
            .tempdir_in(&self.staging_dir)
            .map_err(|err| ConversionError::staging(path, err))?;

        let checked_out = self
            .vcs
            .checkout_path(&root, &commit, &relative, &clone)
            .await
            .map_err(|err| rename_path(err, path))?;

        info!(
            target = "application::materialize",
            op = "materialize::checkout",
            result = "checked_out",
            path = %path.display(),
            revision = %revision,
            commit = %commit,
            clone = %clone.path().display(),
            "Historical revision checked out"
        );

        Ok(MaterializedFile::Checkout {
            path: checked_out,
            clone,
        })
    }
}

/// Report version-control failures against the path the caller asked for.
fn rename_path(err: ConversionError, reference: &Path) -> ConversionError {
    match err {
        ConversionError::RepositoryRootNotFound { detail, .. } => {
            ConversionError::repository_root_not_found(reference, detail)
        }
        ConversionError::CheckoutFailed {
            revision, detail, ..
        } => ConversionError::checkout_failed(reference, revision, detail),
        ConversionError::FileNotFoundAtRevision { revision, .. } => {
            ConversionError::file_not_found_at_revision(reference, revision)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    const HEAD: &str = "0123456789abcdef0123456789abcdef01234567";

    /// Records calls and serves files out of an in-memory commit table.
    #[derive(Default)]
    struct RecordingVcs {
        root: Mutex<Option<PathBuf>>,
        calls: Mutex<Vec<String>>,
        files: Vec<(&'static str, &'static str, &'static [u8])>,
    }

    impl RecordingVcs {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }
    }

    #[async_trait]
    impl VersionControl for RecordingVcs {
        async fn repository_root(&self, dir: &Path) -> Result<PathBuf, ConversionError> {
            self.record(format!("root {}", dir.display()));
            self.root
                .lock()
                .expect("root")
                .clone()
                .ok_or_else(|| ConversionError::repository_root_not_found(dir, "not a repository"))
        }

        async fn resolve_head(&self, _root: &Path) -> Result<String, ConversionError> {
            self.record("head".to_string());
            Ok(HEAD.to_string())
        }

        async fn checkout_path(
            &self,
            _root: &Path,
            revision: &str,
            relative: &Path,
            scratch: &TempDir,
        ) -> Result<PathBuf, ConversionError> {
            self.record(format!("checkout {revision} {}", relative.display()));
            let Some((_, _, bytes)) = self
                .files
                .iter()
                .find(|(rev, rel, _)| *rev == revision && Path::new(rel) == relative)
            else {
                return Err(ConversionError::file_not_found_at_revision(
                    relative, revision,
                ));
            };
            let target = scratch.path().join(relative);
            std::fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
            std::fs::write(&target, bytes).expect("write");
            Ok(target)
        }
    }

    fn entries(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).expect("read dir").count()
    }

    fn materializer(staging: &TempDir, vcs: Arc<RecordingVcs>) -> Materializer {
        Materializer::new(staging.path().to_path_buf(), vcs)
    }

    #[tokio::test]
    async fn matching_buffer_renders_in_place() {
        let work = TempDir::new().expect("work");
        let staging = TempDir::new().expect("staging");
        let vi = work.path().join("Main.vi");
        std::fs::write(&vi, b"RSRC-main").expect("write vi");

        let materialized = materializer(&staging, Arc::default())
            .materialize(&FileReference::local_with_buffer(&vi, &b"RSRC-main"[..]))
            .await
            .expect("materialize");

        assert!(matches!(materialized, MaterializedFile::OnDisk { .. }));
        assert_eq!(materialized.path(), vi);
        assert!(materialized.warning().is_none());
        assert_eq!(entries(&staging), 0);
        materialized.cleanup().expect("cleanup");
        assert!(vi.exists());
    }

    #[tokio::test]
    async fn differing_buffer_is_staged_with_warning() {
        let work = TempDir::new().expect("work");
        let staging = TempDir::new().expect("staging");
        let ctl = work.path().join("State.ctl");
        std::fs::write(&ctl, b"saved").expect("write ctl");

        let materialized = materializer(&staging, Arc::default())
            .materialize(&FileReference::local_with_buffer(&ctl, &b"unsaved edit"[..]))
            .await
            .expect("materialize");

        let staged = materialized.path().to_path_buf();
        assert_ne!(staged, ctl);
        assert_eq!(staged.extension().and_then(|ext| ext.to_str()), Some("ctl"));
        assert_eq!(std::fs::read(&staged).expect("staged bytes"), b"unsaved edit");
        assert_eq!(materialized.warning(), Some(STAGING_WARNING));
        assert_eq!(entries(&staging), 1);

        materialized.cleanup().expect("cleanup");
        assert!(!staged.exists());
        assert_eq!(entries(&staging), 0);
    }

    #[tokio::test]
    async fn staged_copy_is_removed_on_drop() {
        let staging = TempDir::new().expect("staging");
        let reference = FileReference::Virtual {
            locator: "Untitled 1".to_string(),
            extension: "vi".to_string(),
            contents: Bytes::from_static(b"RSRC"),
        };

        let materialized = materializer(&staging, Arc::default())
            .materialize(&reference)
            .await
            .expect("materialize");
        assert!(materialized.path().to_string_lossy().ends_with(".vi"));
        drop(materialized);

        assert_eq!(entries(&staging), 0);
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let staging = TempDir::new().expect("staging");
        let err = materializer(&staging, Arc::default())
            .materialize(&FileReference::local(staging.path().join("gone.vi")))
            .await
            .expect_err("missing file");
        assert!(matches!(err, ConversionError::Staging { .. }));
    }

    #[tokio::test]
    async fn absent_revision_fails_without_version_control() {
        let staging = TempDir::new().expect("staging");
        let vcs = Arc::new(RecordingVcs::default());
        let err = materializer(&staging, vcs.clone())
            .materialize(&FileReference::historical("/repo/Main.vi", None))
            .await
            .expect_err("no revision");

        assert!(matches!(err, ConversionError::RevisionMissing { .. }));
        assert!(vcs.calls().is_empty());
    }

    #[tokio::test]
    async fn working_copy_marker_resolves_to_head() {
        let repo = TempDir::new().expect("repo");
        let staging = TempDir::new().expect("staging");
        std::fs::create_dir_all(repo.path().join("src")).expect("mkdir");
        let root = std::fs::canonicalize(repo.path()).expect("canonical root");
        let vcs = Arc::new(RecordingVcs {
            root: Mutex::new(Some(root)),
            files: vec![(HEAD, "src/Main.vi", b"RSRC-head")],
            ..Default::default()
        });

        let materialized = materializer(&staging, vcs.clone())
            .materialize(&FileReference::historical(
                repo.path().join("src").join("Main.vi"),
                Revision::parse("~"),
            ))
            .await
            .expect("materialize");

        assert_eq!(
            std::fs::read(materialized.path()).expect("checked out"),
            b"RSRC-head"
        );
        let calls = vcs.calls();
        assert_eq!(calls[1], "head");
        assert_eq!(calls[2], format!("checkout {HEAD} src/Main.vi"));

        assert_eq!(entries(&staging), 1);
        materialized.cleanup().expect("cleanup");
        assert_eq!(entries(&staging), 0);
    }

    #[tokio::test]
    async fn missing_file_at_revision_names_reference_path() {
        let repo = TempDir::new().expect("repo");
        let staging = TempDir::new().expect("staging");
        let root = std::fs::canonicalize(repo.path()).expect("canonical root");
        let vcs = Arc::new(RecordingVcs {
            root: Mutex::new(Some(root)),
            ..Default::default()
        });
        let reference = repo.path().join("Deleted.vi");

        let err = materializer(&staging, vcs)
            .materialize(&FileReference::historical(
                &reference,
                Some(Revision::Commit("abc123".to_string())),
            ))
            .await
            .expect_err("missing at revision");

        match err {
            ConversionError::FileNotFoundAtRevision { path, revision } => {
                assert_eq!(path, reference);
                assert_eq!(revision, "abc123");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(entries(&staging), 0);
    }

    #[tokio::test]
    async fn root_lookup_failure_names_reference_path() {
        let work = TempDir::new().expect("work");
        let staging = TempDir::new().expect("staging");
        let reference = work.path().join("Main.vi");

        let err = materializer(&staging, Arc::default())
            .materialize(&FileReference::historical(
                &reference,
                Some(Revision::WorkingCopy),
            ))
            .await
            .expect_err("no repository");

        match err {
            ConversionError::RepositoryRootNotFound { path, .. } => assert_eq!(path, reference),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn length_mismatch_short_circuits_comparison() {
        let work = TempDir::new().expect("work");
        let vi = work.path().join("Main.vi");
        std::fs::write(&vi, b"abc").expect("write");

        assert!(Materializer::bytes_match_on_disk(&vi, b"abc").await);
        assert!(!Materializer::bytes_match_on_disk(&vi, b"abcd").await);
        assert!(!Materializer::bytes_match_on_disk(&vi, b"abd").await);
        assert!(!Materializer::bytes_match_on_disk(&work.path().join("none.vi"), b"").await);
    }
}

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Failure of a single conversion call.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(
        "timed out after {}ms waiting for VI conversion lock `{}` to be released",
        .waited.as_millis(),
        .path.display()
    )]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("failed to create VI conversion lock `{}`: {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not determine revision for historical file `{}`", .path.display())]
    RevisionMissing { path: PathBuf },
    #[error("could not determine git repository root for file: {} ({detail})", .path.display())]
    RepositoryRootNotFound { path: PathBuf, detail: String },
    #[error("failed to check out `{}` at revision `{revision}`: {detail}", .path.display())]
    CheckoutFailed {
        path: PathBuf,
        revision: String,
        detail: String,
    },
    #[error("file `{}` not found in checked out revision `{revision}`", .path.display())]
    FileNotFoundAtRevision { path: PathBuf, revision: String },
    #[error("failed to materialize VI `{}`: {source}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to convert VI file: {cause}")]
    RendererInvocationFailed {
        #[source]
        cause: RenderFailure,
    },
    #[error("failed to convert VI file: could not remove output `{}`: {source}", .path.display())]
    ArtifactCleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Underlying cause carried by [`ConversionError::RendererInvocationFailed`].
#[derive(Debug, Error)]
pub enum RenderFailure {
    #[error("renderer CLI `{program}` could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("renderer CLI exited with status {exit_code:?}: {stderr}")]
    Exit {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("renderer produced no output at `{}`: {source}", .path.display())]
    MissingArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConversionError {
    pub fn lock_timeout(path: impl Into<PathBuf>, waited: Duration) -> Self {
        Self::LockTimeout {
            path: path.into(),
            waited,
        }
    }

    pub fn revision_missing(path: impl Into<PathBuf>) -> Self {
        Self::RevisionMissing { path: path.into() }
    }

    pub fn repository_root_not_found(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::RepositoryRootNotFound {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn checkout_failed(
        path: impl Into<PathBuf>,
        revision: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::CheckoutFailed {
            path: path.into(),
            revision: revision.into(),
            detail: detail.into(),
        }
    }

    pub fn file_not_found_at_revision(path: impl Into<PathBuf>, revision: impl Into<String>) -> Self {
        Self::FileNotFoundAtRevision {
            path: path.into(),
            revision: revision.into(),
        }
    }

    pub fn staging(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    pub fn renderer(cause: RenderFailure) -> Self {
        Self::RendererInvocationFailed { cause }
    }

    /// Stable label used for the `result` field of logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockIo { .. } => "lock_io",
            Self::RevisionMissing { .. } => "revision_missing",
            Self::RepositoryRootNotFound { .. } => "repository_root_not_found",
            Self::CheckoutFailed { .. } => "checkout_failed",
            Self::FileNotFoundAtRevision { .. } => "file_not_found_at_revision",
            Self::Staging { .. } => "staging",
            Self::RendererInvocationFailed { .. } => "renderer_invocation_failed",
            Self::ArtifactCleanupFailed { .. } => "artifact_cleanup_failed",
        }
    }
}

impl From<RenderFailure> for ConversionError {
    fn from(cause: RenderFailure) -> Self {
        Self::renderer(cause)
    }
}

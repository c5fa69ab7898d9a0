//! Source document references and revision markers.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use url::{Url, form_urlencoded};

/// Marker used by editors for "the working copy" of a version-controlled file.
pub const WORKING_COPY_MARKER: &str = "~";

/// Extension used for staged copies when the source has none.
pub const DEFAULT_EXTENSION: &str = "vi";

/// Revision of a version-controlled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// The current head of the repository.
    WorkingCopy,
    Commit(String),
}

impl Revision {
    /// Parse an editor-supplied revision. Empty input has no revision.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed {
            "" => None,
            WORKING_COPY_MARKER => Some(Self::WorkingCopy),
            other => Some(Self::Commit(other.to_string())),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkingCopy => f.write_str(WORKING_COPY_MARKER),
            Self::Commit(commit) => f.write_str(commit),
        }
    }
}

/// Identifies the document whose bytes should be rendered.
#[derive(Debug, Clone)]
pub enum FileReference {
    /// A real file on disk, optionally with the editor's in-memory bytes.
    Local { path: PathBuf, buffer: Option<Bytes> },
    /// Bytes without an on-disk counterpart.
    Virtual {
        locator: String,
        extension: String,
        contents: Bytes,
    },
    /// A version-controlled file at a revision.
    Historical {
        path: PathBuf,
        revision: Option<Revision>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid document URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("document `{locator}` has no on-disk file and no buffered contents")]
    MissingContents { locator: String },
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    #[serde(rename = "ref", default)]
    revision: Option<String>,
}

impl FileReference {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local {
            path: path.into(),
            buffer: None,
        }
    }

    pub fn local_with_buffer(path: impl Into<PathBuf>, buffer: impl Into<Bytes>) -> Self {
        Self::Local {
            path: path.into(),
            buffer: Some(buffer.into()),
        }
    }

    pub fn historical(path: impl Into<PathBuf>, revision: Option<Revision>) -> Self {
        Self::Historical {
            path: path.into(),
            revision,
        }
    }

    /// Build a reference from an editor document URI.
    ///
    /// `git:` and `gitlens:` URIs carry their revision as the `ref` member of a
    /// JSON query string. Unknown schemes are treated as virtual documents and
    /// require `buffer`.
    pub fn from_uri(uri: &str, buffer: Option<Bytes>) -> Result<Self, ReferenceError> {
        let parsed = Url::parse(uri).map_err(|err| ReferenceError::InvalidUri {
            uri: uri.to_string(),
            reason: err.to_string(),
        })?;

        match parsed.scheme() {
            "file" => {
                let path = uri_path(&parsed, uri)?;
                Ok(Self::Local { path, buffer })
            }
            "git" | "gitlens" => {
                let path = uri_path(&parsed, uri)?;
                let revision = parsed
                    .query()
                    .map(decode_query)
                    .map(|query| parse_revision_query(&query, uri))
                    .transpose()?
                    .flatten();
                Ok(Self::Historical { path, revision })
            }
            _ => {
                let locator = parsed.path().to_string();
                let contents = buffer.ok_or_else(|| ReferenceError::MissingContents {
                    locator: uri.to_string(),
                })?;
                let extension = extension_of(Path::new(&locator)).to_string();
                Ok(Self::Virtual {
                    locator,
                    extension,
                    contents,
                })
            }
        }
    }

    /// Path or locator used in logs and error messages.
    pub fn display_path(&self) -> String {
        match self {
            Self::Local { path, .. } | Self::Historical { path, .. } => {
                path.display().to_string()
            }
            Self::Virtual { locator, .. } => locator.clone(),
        }
    }

    /// Short label for structured logs.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Virtual { .. } => "virtual",
            Self::Historical { .. } => "historical",
        }
    }
}

/// Extension used when staging a copy of `path`.
pub fn extension_of(path: &Path) -> &str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or(DEFAULT_EXTENSION)
}

fn uri_path(parsed: &Url, uri: &str) -> Result<PathBuf, ReferenceError> {
    parsed
        .to_file_path()
        .map_err(|()| ReferenceError::InvalidUri {
            uri: uri.to_string(),
            reason: "URI does not name a filesystem path".to_string(),
        })
}

fn decode_query(raw: &str) -> String {
    // The query is a bare JSON document, so the whole string decodes as a single key.
    form_urlencoded::parse(raw.as_bytes())
        .map(|(key, value)| {
            if value.is_empty() {
                key.into_owned()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_revision_query(query: &str, uri: &str) -> Result<Option<Revision>, ReferenceError> {
    let parsed: HistoricalQuery =
        serde_json::from_str(query).map_err(|err| ReferenceError::InvalidUri {
            uri: uri.to_string(),
            reason: format!("query is not a JSON revision descriptor: {err}"),
        })?;
    Ok(parsed.revision.as_deref().and_then(Revision::parse))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_copy_marker_parses() {
        assert_eq!(Revision::parse("~"), Some(Revision::WorkingCopy));
        assert_eq!(
            Revision::parse("3f2a9c1"),
            Some(Revision::Commit("3f2a9c1".to_string()))
        );
        assert_eq!(Revision::parse(""), None);
        assert_eq!(Revision::parse("   "), None);
    }

    #[cfg(unix)]
    #[test]
    fn file_uri_becomes_local_reference() {
        let reference = FileReference::from_uri("file:///work/Main.vi", None).expect("file uri");
        match reference {
            FileReference::Local { path, buffer } => {
                assert_eq!(path, PathBuf::from("/work/Main.vi"));
                assert!(buffer.is_none());
            }
            other => panic!("unexpected reference: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn git_uri_reads_revision_from_json_query() {
        let uri = r#"git:/work/Main.vi?{"path":"/work/Main.vi","ref":"~"}"#;
        let reference = FileReference::from_uri(uri, None).expect("git uri");
        match reference {
            FileReference::Historical { path, revision } => {
                assert_eq!(path, PathBuf::from("/work/Main.vi"));
                assert_eq!(revision, Some(Revision::WorkingCopy));
            }
            other => panic!("unexpected reference: {other:?}"),
        }

        let uri = r#"gitlens:/work/Main.vi?{"ref":"a1b2c3"}"#;
        let reference = FileReference::from_uri(uri, None).expect("gitlens uri");
        assert!(matches!(
            reference,
            FileReference::Historical {
                revision: Some(Revision::Commit(ref c)),
                ..
            } if c == "a1b2c3"
        ));
    }

    #[cfg(unix)]
    #[test]
    fn git_uri_without_ref_has_no_revision() {
        let uri = r#"git:/work/Main.vi?{"path":"/work/Main.vi","ref":""}"#;
        let reference = FileReference::from_uri(uri, None).expect("git uri");
        assert!(matches!(
            reference,
            FileReference::Historical { revision: None, .. }
        ));
    }

    #[test]
    fn unknown_scheme_requires_buffer() {
        let err = FileReference::from_uri("untitled:Untitled-1.vi", None).expect_err("no buffer");
        assert!(matches!(err, ReferenceError::MissingContents { .. }));

        let reference =
            FileReference::from_uri("untitled:Untitled-1.vim", Some(Bytes::from_static(b"RSRC")))
                .expect("virtual");
        match reference {
            FileReference::Virtual {
                extension,
                contents,
                ..
            } => {
                assert_eq!(extension, "vim");
                assert_eq!(&contents[..], b"RSRC");
            }
            other => panic!("unexpected reference: {other:?}"),
        }
    }

    #[test]
    fn extension_defaults_to_vi() {
        assert_eq!(extension_of(Path::new("/a/b/Control.ctl")), "ctl");
        assert_eq!(extension_of(Path::new("/a/b/noext")), "vi");
    }
}

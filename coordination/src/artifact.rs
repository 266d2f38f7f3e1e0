//! Atomic artifact I/O
//!
//! Every file the pipeline produces is written to a sibling temp path,
//! flushed, and renamed into place. A reader therefore never observes a
//! half-written artifact: the file either does not exist or is complete.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors raised while reading or writing pipeline artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ArtifactError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path of the artifact this error refers to
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound { path } | Self::Io { path, .. } | Self::Malformed { path, .. } => path,
        }
    }
}

/// Result type for artifact operations
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Staging path used while an artifact is being produced.
///
/// `captions.json` stages as `captions.json.partial` in the same directory so
/// the final rename never crosses a filesystem boundary.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Create a directory and its parents, succeeding if it already exists
pub fn ensure_dir(path: &Path) -> ArtifactResult<()> {
    fs::create_dir_all(path).map_err(|e| ArtifactError::io(path, e))
}

/// Write bytes to `path` atomically (temp file, fsync, rename)
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> ArtifactResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    let tmp = staging_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| ArtifactError::io(&tmp, e))?;
        file.write_all(bytes)
            .map_err(|e| ArtifactError::io(&tmp, e))?;
        file.sync_all().map_err(|e| ArtifactError::io(&tmp, e))?;
    }

    promote(&tmp, path)
}

/// Write text to `path` atomically
pub fn write_text_atomic(path: &Path, text: &str) -> ArtifactResult<()> {
    write_bytes_atomic(path, text.as_bytes())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> ArtifactResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_bytes_atomic(path, &json)
}

/// Move a fully written staging file into its final place
pub fn promote(staged: &Path, path: &Path) -> ArtifactResult<()> {
    fs::rename(staged, path).map_err(|e| ArtifactError::io(path, e))
}

/// Read and deserialize a JSON artifact
pub fn read_json<T: DeserializeOwned>(path: &Path) -> ArtifactResult<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(ArtifactError::io(path, e)),
    };

    serde_json::from_slice(&bytes).map_err(|e| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Remove a file if present
pub fn remove_if_exists(path: &Path) -> ArtifactResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ArtifactError::io(path, e)),
    }
}

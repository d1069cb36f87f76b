//! Typed errors surfaced to the operator-facing collaborator

use std::path::PathBuf;

use thiserror::Error;

use crate::session::ControllerState;

/// Which of the two session files an operation concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Record,
    Response,
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileRole::Record => write!(f, "record"),
            FileRole::Response => write!(f, "response"),
        }
    }
}

/// Failure opening, writing or closing a trace/response file
#[derive(Debug, Error)]
pub enum FileError {
    #[error("no file selected")]
    NotSelected,

    #[error("file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("I/O failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            FileError::NotFound(path)
        } else {
            FileError::Io { path, source }
        }
    }
}

/// Failure of a record/replay control operation
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no {0} file selected")]
    NoFileSelected(FileRole),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ControllerState,
    },
}

/// Console line that is not a session command
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} needs a path")]
    MissingPath(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_classified() {
        let err = FileError::from_io(
            "/tmp/missing.trace",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, FileError::NotFound(_)));

        let err = FileError::from_io(
            "/tmp/locked.trace",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, FileError::Io { .. }));
    }
}

use std::io;
use std::path::{Path, PathBuf};

/// A single "cause" describing a failed syscall: the function that failed,
/// the underlying I/O error, and the path(s) involved.
///
/// Mirrors the shape of the original project's `io_error` exception (function
/// name + errno + one or two paths) so the driver can print exactly one
/// diagnostic line per failed phase.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{func}: {source} ({path})", path = path.display())]
    Io {
        func: &'static str,
        #[source]
        source: io::Error,
        path: PathBuf,
    },
    #[error("{func}: {source} (source: {path}, dest: {path2})", path = path.display(), path2 = path2.display())]
    Io2 {
        func: &'static str,
        #[source]
        source: io::Error,
        path: PathBuf,
        path2: PathBuf,
    },
    #[error("invalid journal: {0}")]
    InvalidJournal(String),
    #[error("invalid state for this operation")]
    InvalidState,
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io(func: &'static str, source: io::Error, path: impl AsRef<Path>) -> Self {
        Error::Io {
            func,
            source,
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn io2(
        func: &'static str,
        source: io::Error,
        path: impl AsRef<Path>,
        path2: impl AsRef<Path>,
    ) -> Self {
        Error::Io2 {
            func,
            source,
            path: path.as_ref().to_path_buf(),
            path2: path2.as_ref().to_path_buf(),
        }
    }

    /// The raw errno behind this error, if it carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } | Error::Io2 { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True if this error's io::ErrorKind matches (NotFound, AlreadyExists, ...).
    pub fn is_kind(&self, kind: io::ErrorKind) -> bool {
        match self {
            Error::Io { source, .. } | Error::Io2 { source, .. } => source.kind() == kind,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

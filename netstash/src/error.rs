//! Error types shared across the cache layers.

use std::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by the cache, the partial-content reader, or the
/// cached-HTTP coordinator.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A sidecar file failed to parse.
    ///
    /// Partial-content opens recover from this by refetching from the
    /// origin; header peeks report it as an absent entry.
    MalformedSidecar(&'static str),
    /// The URL stored in a sidecar differs from the requested URL for the
    /// same 64-bit key. The entry is invalidated.
    HashCollision {
        key: u64,
        stored: String,
        requested: String,
    },
    /// A non-2xx response or a failure while talking to the origin.
    Http { status: u16, message: String },
    /// A download reported success but left a zero-length data file.
    EmptyCache(PathBuf),
    /// A filesystem failure.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedSidecar(what) => write!(f, "malformed sidecar: {what}"),
            Self::HashCollision {
                key,
                stored,
                requested,
            } => write!(
                f,
                "key {key:x} collision: sidecar holds {stored:?}, requested {requested:?}"
            ),
            Self::Http { status, message } => write!(f, "http error {status}: {message}"),
            Self::EmptyCache(path) => {
                write!(f, "empty data file after download: {}", path.display())
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => err,
            Error::MalformedSidecar(_) => io::Error::new(io::ErrorKind::InvalidData, value),
            Error::HashCollision { .. } => io::Error::new(io::ErrorKind::InvalidData, value),
            Error::EmptyCache(_) => io::Error::new(io::ErrorKind::UnexpectedEof, value),
            Error::Http { .. } => io::Error::other(value),
        }
    }
}

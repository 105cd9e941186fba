//! Error types surfaced by pools and the collector.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

/// A specialized result type for pool and collector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of engine failures.
///
/// All kinds are fatal to the operation that reported them; the engine never
/// retries on behalf of the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The pool file could not be created, opened, locked, or mapped.
    PoolUnavailable,
    /// The pool ran out of space for an allocation.
    AllocFailed,
    /// Persistent state failed validation during open or recovery.
    RecoveryCorrupt,
    /// An argument was out of range or referred to an unknown target.
    InvalidArgument,
}

/// An error raised by a pool or by the collector.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            source: None,
        }
    }

    /// The kind of failure this error reports.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub(crate) fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

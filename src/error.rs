//! The error kinds a change or a wait can fail with.

use std::fmt;
use std::io;

/// Raw error codes reported in a synthetic event's `data` field.
///
/// These match the historical POSIX errno values for the three conditions
/// this crate can report on its own account, independent of whatever a
/// back-end syscall returns for [`Error::Backend`].
mod raw {
    pub const ENOENT: i64 = 2;
    pub const EINVAL: i64 = 22;
    pub const EFAULT: i64 = 14;
    pub const ECANCELED: i64 = 125;
}

/// A failure surfaced by the dispatch engine or a filter hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unknown queue descriptor, or a change referred to a non-existent
    /// knote without `ADD`.
    NotFound,
    /// Conflicting flags, an unsupported filter-kind, or an out-of-range
    /// ident.
    InvalidArgument,
    /// A filter's `create`/`modify` hook rejected the interest.
    Fault,
    /// The back-end's wait call failed; `raw_os_error` is whatever the
    /// platform reported.
    Backend(i32),
    /// The queue was closed by another thread while this call was blocked
    /// in its wait phase (§5).
    Closed,
    /// The caller's event-list was already full when a successful change
    /// still needed a synthetic `RECEIPT` entry.
    Overflow,
}

impl Error {
    /// The value recorded in an event's `data` field when this error is
    /// reported as a synthetic `ERROR` entry.
    pub fn raw_code(self) -> i64 {
        match self {
            Error::NotFound => raw::ENOENT,
            Error::InvalidArgument => raw::EINVAL,
            Error::Fault => raw::EFAULT,
            Error::Backend(code) => code as i64,
            Error::Closed => raw::ECANCELED,
            Error::Overflow => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "no such knote or queue"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Fault => write!(f, "filter rejected the registration"),
            Error::Backend(code) => write!(f, "back-end failure (errno {code})"),
            Error::Closed => write!(f, "queue closed while waiting"),
            Error::Overflow => write!(f, "event list is full"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::NotFound => io::Error::new(io::ErrorKind::NotFound, e),
            Error::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, e),
            Error::Fault => io::Error::from_raw_os_error(raw::EFAULT as i32),
            Error::Backend(code) => io::Error::from_raw_os_error(code),
            Error::Closed => io::Error::new(io::ErrorKind::Other, e),
            Error::Overflow => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

/// Builds the `io::Error` returned by `kevent` when a per-change failure
/// cannot be materialized because the event-list is already full.
pub(crate) fn overflow_error(last: Error) -> io::Error {
    last.into()
}

use std::{fmt, io};

use static_assertions::assert_impl_all;

use crate::coroutine::Status;

/// Errors from fallible coroutine operations.
///
/// None of them is fatal, the manager and its coroutines stay usable afterwards.
pub enum Error {
    /// Stack or host context could not be created.
    AllocationFailed(io::Error),
    /// Only [Status::Ready] coroutines could be resumed.
    NotResumable(Status),
    /// No coroutine of the manager is executing on calling stack.
    NoActiveCoroutine,
    /// Coroutine was created by another manager.
    UnknownCoroutine,
}

assert_impl_all!(Error: Send, Sync);

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailed(err) => write!(f, "Error::AllocationFailed({:?})", err),
            Error::NotResumable(status) => write!(f, "Error::NotResumable({:?})", status),
            Error::NoActiveCoroutine => f.write_str("Error::NoActiveCoroutine"),
            Error::UnknownCoroutine => f.write_str("Error::UnknownCoroutine"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailed(err) => write!(f, "fail to allocate coroutine: {}", err),
            Error::NotResumable(status) => write!(f, "coroutine not resumable: {}", status),
            Error::NoActiveCoroutine => f.write_str("no running coroutine to yield"),
            Error::UnknownCoroutine => f.write_str("coroutine belongs to other manager"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AllocationFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::AllocationFailed(err)
    }
}

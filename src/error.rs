use std::{fmt, time::Duration};

use crate::{address::ParseAddressError, uuid::ParseUuidError};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
///
/// Use [`Error::kind`] to find out which class of failure occurred.
#[derive(Debug)]
pub struct Error {
    inner: Repr,
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An adapter, device, service or characteristic does not exist.
    NotFound,
    /// A bounded wait or read did not complete before its deadline.
    Timeout,
    /// More than one device reports the same address.
    ///
    /// This indicates an inconsistency in the daemon's state and is not retried.
    AmbiguousMatch,
    /// A UUID or address string is malformed.
    Validation,
    /// A remote method call or property access failed.
    Remote,
    /// Anything else (eg. a signal stream ended unexpectedly).
    Other,
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self { inner: e.into() }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self {
            inner: Repr::NotFound(what.into()),
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self {
            inner: Repr::Timeout {
                what: what.into(),
                after,
            },
        }
    }

    pub(crate) fn ambiguous(address: impl Into<String>, count: usize) -> Self {
        Self {
            inner: Repr::Ambiguous {
                address: address.into(),
                count,
            },
        }
    }

    /// Returns the [`ErrorKind`] describing this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            Repr::Zbus(_) | Repr::Fdo(_) => ErrorKind::Remote,
            Repr::ParseAddressError(_) | Repr::ParseUuidError(_) => ErrorKind::Validation,
            Repr::NotFound(_) => ErrorKind::NotFound,
            Repr::Timeout { .. } => ErrorKind::Timeout,
            Repr::Ambiguous { .. } => ErrorKind::AmbiguousMatch,
            Repr::Other(_) => ErrorKind::Other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Repr::Zbus(e) => e.fmt(f),
            Repr::Fdo(e) => e.fmt(f),
            Repr::ParseAddressError(e) => e.fmt(f),
            Repr::ParseUuidError(e) => e.fmt(f),
            Repr::NotFound(what) => write!(f, "{} not found", what),
            Repr::Timeout { what, after } => {
                write!(f, "timed out after {:?} waiting for {}", after, what)
            }
            Repr::Ambiguous { address, count } => {
                write!(f, "{} devices share the address {}", count, address)
            }
            Repr::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            Repr::Zbus(e) => Some(e),
            Repr::Fdo(e) => Some(e),
            Repr::ParseAddressError(e) => Some(e),
            Repr::ParseUuidError(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Repr {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    ParseAddressError(ParseAddressError),
    ParseUuidError(ParseUuidError),
    NotFound(String),
    Timeout { what: String, after: Duration },
    Ambiguous { address: String, count: usize },
    Other(String),
}

impl From<zbus::Error> for Repr {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for Repr {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<ParseAddressError> for Repr {
    fn from(value: ParseAddressError) -> Self {
        Self::ParseAddressError(value)
    }
}

impl From<ParseUuidError> for Repr {
    fn from(value: ParseUuidError) -> Self {
        Self::ParseUuidError(value)
    }
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for Repr {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

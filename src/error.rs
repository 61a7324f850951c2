/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::{Error as IoError, ErrorKind};

use thiserror::Error;

/// The error type for **ptio** operations
///
/// Resource contention ([`Pending`](Error::Pending)) is always recoverable:
/// the caller is expected to finish or cancel the outstanding operation
/// first. Transport errors from the **`mio`** layer are passed through
/// "as-is" in the [`Io`](Error::Io) variant.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation of the same kind is already outstanding on the device,
    /// or a blocking call was attempted while an operation is outstanding.
    #[error("an I/O operation is already pending")]
    Pending,
    /// An `end_*` call was made without a matching `begin_*` call.
    #[error("no I/O operation is pending")]
    NotPending,
    /// The operation was cancelled before completion.
    #[error("the operation was cancelled")]
    Cancelled,
    /// The operation did not complete within the configured timeout. Data may
    /// have been read or written partially!
    #[error("the operation timed out")]
    TimedOut,
    /// The stream was closed before the operation could complete.
    #[error("the stream closed before the operation completed")]
    Incomplete,
    #[error("the object is not attached to an event loop")]
    NotAttached,
    #[error("the object is already attached to an event loop")]
    AlreadyAttached,
    #[error("the socket is not connected")]
    NotConnected,
    #[error("the socket is already connected")]
    AlreadyConnected,
    /// Malformed or oversized HTTP message, or an invalid credential string.
    #[error("HTTP protocol error: {0}")]
    Http(String),
    /// Failure reported by the TLS connection collaborator.
    #[error("SSL error: {0}")]
    Ssl(String),
    #[error(transparent)]
    Io(#[from] IoError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn http(message: impl Into<String>) -> Self {
        Self::Http(message.into())
    }

    pub(crate) fn ssl(message: impl Into<String>) -> Self {
        Self::Ssl(message.into())
    }

    /// The [`ErrorKind`] this error maps to when converted into an
    /// [`std::io::Error`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pending => ErrorKind::WouldBlock,
            Self::NotPending => ErrorKind::Other,
            Self::Cancelled => ErrorKind::Interrupted,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::Incomplete => ErrorKind::UnexpectedEof,
            Self::NotAttached => ErrorKind::Other,
            Self::AlreadyAttached => ErrorKind::Other,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::AlreadyConnected => ErrorKind::AlreadyExists,
            Self::Http(_) => ErrorKind::InvalidData,
            Self::Ssl(_) => ErrorKind::Other,
            Self::Io(error) => error.kind(),
        }
    }
}

impl From<Error> for IoError {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(inner) => inner,
            other => IoError::new(other.kind(), other),
        }
    }
}

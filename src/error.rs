//! The error taxonomy shared by every layer of the pipe engine.
//!
//! Lower layers (the circular buffer, the codec) use plain `io::Result`.
//! Everything from the pipe object upward speaks [`Error`], which is rich
//! enough to carry the distinctions the pipe state machine actually makes
//! (e.g. "no peer reader" vs. "nonblocking call made no progress") while
//! still converting cleanly to an `i32` errno at the FUSE boundary and to
//! `io::Error` wherever the standard I/O traits are expected.

use std::io;

/// Abstract error kinds produced by the pipe engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read-write open was requested; only read-only or write-only are supported.
    #[error("invalid argument")]
    InvalidArgument,
    /// The pipe's local endpoint is already open in the other access mode.
    #[error("permission denied")]
    PermissionDenied,
    /// The operation targets a pipe that is being (or has been) torn down.
    #[error("no such entry")]
    NoSuchEntry,
    /// A nonblocking call could not make any progress.
    #[error("resource temporarily unavailable")]
    TryAgain,
    /// No peer reader/writer exists, a peer-side close aborted a pending
    /// operation, or the channel to the peer was lost.
    #[error("broken pipe")]
    BrokenPipe,
    /// A send to the peer failed outright (as opposed to simply finding no
    /// reader on the other end).
    #[error("connection reset by peer")]
    ConnectionReset,
    /// A synchronization primitive failed, or a protocol invariant was
    /// violated by the peer.
    #[error("internal error: {0}")]
    Internal(String),
    /// Any lower-level I/O failure that doesn't cleanly fit the taxonomy
    /// above.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps this error onto the POSIX errno FUSE callbacks are expected to
    /// return (as a positive `i32`, per the `fuser::Filesystem` contract).
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::PermissionDenied => libc::EPERM,
            Error::NoSuchEntry => libc::ENOENT,
            Error::TryAgain => libc::EAGAIN,
            Error::BrokenPipe => libc::EPIPE,
            Error::ConnectionReset => libc::ECONNRESET,
            Error::Internal(_) => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_taxonomy() {
        assert_eq!(Error::InvalidArgument.to_errno(), libc::EINVAL);
        assert_eq!(Error::PermissionDenied.to_errno(), libc::EPERM);
        assert_eq!(Error::NoSuchEntry.to_errno(), libc::ENOENT);
        assert_eq!(Error::TryAgain.to_errno(), libc::EAGAIN);
        assert_eq!(Error::BrokenPipe.to_errno(), libc::EPIPE);
        assert_eq!(Error::ConnectionReset.to_errno(), libc::ECONNRESET);
    }
}

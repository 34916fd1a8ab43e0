//! Integer error codes delivered to completion handlers.
//!
//! Handlers receive an [`ErrorCode`] rather than an `io::Error`: completion
//! paths never unwind, and the sentinel values (end-of-stream, canceled) need
//! stable representations that survive a round trip through plain integers.
//! OS errors are carried as negated errno values; sentinels live outside the
//! errno range.

use std::fmt;
use std::io;

/// Result of an asynchronous operation, delivered to its handler.
///
/// Zero means success. Negative values are either negated OS error numbers
/// or one of the distinguished sentinels below. End-of-stream on a TCP read
/// is reported through [`ErrorCode::EOF`] and is a normal terminal signal,
/// not a failure.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode(i32);

impl ErrorCode {
    /// Successful completion.
    pub const OK: ErrorCode = ErrorCode(0);
    /// The peer closed its end of a stream.
    pub const EOF: ErrorCode = ErrorCode(-4095);
    /// The operation was still queued when its handle was closed.
    pub const CANCELED: ErrorCode = ErrorCode(-4094);
    /// An error without an OS error number.
    pub const UNKNOWN: ErrorCode = ErrorCode(-4093);

    /// Builds a code from an `io::Error`, preserving the OS error number
    /// when one is available.
    pub fn from_io(err: &io::Error) -> ErrorCode {
        match err.raw_os_error() {
            Some(code) => ErrorCode(-code.abs()),
            None => match err.kind() {
                io::ErrorKind::UnexpectedEof => ErrorCode::EOF,
                _ => ErrorCode::UNKNOWN,
            },
        }
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn is_error(self) -> bool {
        self.0 != 0
    }

    /// True for the distinguished end-of-stream value.
    pub fn is_eof(self) -> bool {
        self == ErrorCode::EOF
    }

    /// True when the operation was canceled by a close.
    pub fn is_canceled(self) -> bool {
        self == ErrorCode::CANCELED
    }

    /// The raw integer value.
    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({}: {})", self.0, self)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::OK => f.write_str("ok"),
            ErrorCode::EOF => f.write_str("end of stream"),
            ErrorCode::CANCELED => f.write_str("operation canceled"),
            ErrorCode::UNKNOWN => f.write_str("unknown error"),
            ErrorCode(n) => fmt::Display::fmt(&io::Error::from_raw_os_error(-n), f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_distinct() {
        assert!(ErrorCode::OK.is_ok());
        assert!(ErrorCode::EOF.is_eof());
        assert!(ErrorCode::EOF.is_error());
        assert!(!ErrorCode::EOF.is_canceled());
        assert!(ErrorCode::CANCELED.is_canceled());
    }

    #[test]
    fn test_from_io_keeps_os_error() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        let code = ErrorCode::from_io(&err);
        assert_eq!(code.code(), -libc::ECONNRESET);
        assert!(code.is_error());
        assert!(!code.is_eof());
    }

    #[test]
    fn test_from_io_without_os_error() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(ErrorCode::from_io(&err), ErrorCode::UNKNOWN);
    }
}

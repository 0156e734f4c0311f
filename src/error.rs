//! Error types and Result alias shared by every layer of the crate

use std::fmt;

/// Result codes in the engine's traditional numeric space.
///
/// Only the codes this layer can produce are represented. `Ok` has no
/// variant: success travels through `Result::Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Access permission denied
    Perm = 3,
    /// A lock could not be obtained right now; retryable
    Busy = 5,
    /// Allocation failed
    NoMem = 7,
    /// Attempt to write a readonly file
    ReadOnly = 8,
    /// Operation interrupted
    Interrupt = 9,
    /// The underlying storage failed
    IoErr = 10,
    /// No such VFS, or unknown file-control operation
    NotFound = 12,
    /// Insertion failed because the device is full
    Full = 13,
    /// Unable to open the file
    CantOpen = 14,
    /// API contract violation by the caller
    Misuse = 21,
}

impl ErrorCode {
    /// Numeric result code as surfaced to embedders.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Short static description, matching the engine's errstr convention.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Busy => "database is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Misuse => "bad parameter or other API misuse",
        }
    }
}

/// An error produced by the OS layer, carrying a result code and an
/// optional detail message (usually the stringified OS error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({})", self.code.as_str(), msg),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_are_stable() {
        assert_eq!(ErrorCode::Busy.code(), 5);
        assert_eq!(ErrorCode::NoMem.code(), 7);
        assert_eq!(ErrorCode::IoErr.code(), 10);
        assert_eq!(ErrorCode::NotFound.code(), 12);
        assert_eq!(ErrorCode::CantOpen.code(), 14);
        assert_eq!(ErrorCode::Misuse.code(), 21);
    }

    #[test]
    fn test_display_with_and_without_message() {
        let bare = Error::new(ErrorCode::Busy);
        assert_eq!(bare.to_string(), "database is locked");

        let detailed = Error::with_message(ErrorCode::CantOpen, "no such directory");
        assert_eq!(
            detailed.to_string(),
            "unable to open database file (no such directory)"
        );
    }

    #[test]
    fn test_code_comparison() {
        let err = Error::new(ErrorCode::Busy);
        assert_eq!(err.code, ErrorCode::Busy);
        assert_ne!(err.code, ErrorCode::IoErr);
    }
}

use std::fmt;

use crate::metadata::Metadata;

/// RPC status codes.
///
/// The numeric values are the wire representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Decode a wire integer; out-of-range values map to `Unknown`.
    pub fn from_i32(n: i32) -> Code {
        match n {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "Cancelled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for Code {
    fn default() -> Code {
        Code::Ok
    }
}

/// Terminal status of a call: code, human-readable details, and the
/// trailing metadata delivered alongside it.
#[derive(Debug, Clone, Default)]
pub struct RpcStatus {
    pub code: Code,
    pub details: String,
    pub trailers: Metadata,
}

impl RpcStatus {
    pub fn new(code: Code, details: impl Into<String>) -> RpcStatus {
        RpcStatus {
            code,
            details: details.into(),
            trailers: Metadata::new(),
        }
    }

    pub fn ok() -> RpcStatus {
        RpcStatus::new(Code::Ok, "")
    }

    pub fn cancelled(details: impl Into<String>) -> RpcStatus {
        RpcStatus::new(Code::Cancelled, details)
    }

    pub fn with_trailers(mut self, trailers: Metadata) -> RpcStatus {
        self.trailers = trailers;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.details)
        }
    }
}

/// All error types produced by the wirecall library.
#[derive(Debug)]
pub enum Error {
    /// A programming error: missing credential argument, composing a
    /// sealed credential, reserved method-name prefix, bad option.
    InvalidArgument(String),

    /// The transport rejected a batch (e.g. the call already finished).
    Call(String),

    /// The peer violated the framing protocol.
    Protocol(String),

    /// An I/O error (socket, certificate file, etc.).
    Io(std::io::Error),

    /// A terminal non-OK status from the peer, bearing code, details and
    /// the trailing metadata. Cancellation and deadline expiry surface
    /// through this variant as well.
    Status(RpcStatus),
}

impl Error {
    pub fn status(code: Code, details: impl Into<String>) -> Error {
        Error::Status(RpcStatus::new(code, details))
    }

    /// The status code carried by this error, if it represents one.
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Status(status) => Some(status.code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Call(msg) => write!(f, "call error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Status(status) => write!(f, "rpc error: {status}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<RpcStatus> for Error {
    fn from(status: RpcStatus) -> Self {
        Error::Status(status)
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_wire_value() {
        for n in 0..=16 {
            let code = Code::from_i32(n);
            assert_eq!(code as i32, n);
        }
    }

    #[test]
    fn unknown_wire_values_map_to_unknown() {
        assert_eq!(Code::from_i32(-1), Code::Unknown);
        assert_eq!(Code::from_i32(99), Code::Unknown);
    }

    #[test]
    fn status_display() {
        let status = RpcStatus::new(Code::DeadlineExceeded, "too slow");
        assert_eq!(status.to_string(), "DeadlineExceeded: too slow");

        let status = RpcStatus::ok();
        assert_eq!(status.to_string(), "OK");
    }

    #[test]
    fn error_display_formatting() {
        let err = Error::InvalidArgument("bad method name".into());
        assert_eq!(err.to_string(), "invalid argument: bad method name");

        let err = Error::status(Code::Cancelled, "Cancelled on client");
        assert_eq!(err.to_string(), "rpc error: Cancelled: Cancelled on client");
    }

    #[test]
    fn error_code_extraction() {
        let err = Error::status(Code::Unavailable, "gone");
        assert_eq!(err.code(), Some(Code::Unavailable));

        let err = Error::Call("finished".into());
        assert_eq!(err.code(), None);
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

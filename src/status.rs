//! Unified status codes
//!
//! Every fallible operation in this crate returns `Result<T, Status>`. A
//! `Status` pairs a symbolic [`StatusCode`] with a human readable message, so
//! an embedding runtime can surface the conventional
//! `(nil, message, code_name)` triple without re-deriving errno tables.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::io;

/// Codes that do not correspond to an OS errno start here. The range is
/// disjoint from every errno value on all supported platforms.
const PORTOS_START: i32 = 120_000;

/// Symbolic status code.
///
/// OS-level codes carry their platform errno value; library-level codes
/// (`Eof`, `TimeUp`, `Incomplete`, ...) live above [`PORTOS_START`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum StatusCode {
    Eof = PORTOS_START,
    TimeUp = PORTOS_START + 1,
    Incomplete = PORTOS_START + 2,
    NotImpl = PORTOS_START + 3,
    Mismatch = PORTOS_START + 4,
    BadPath = PORTOS_START + 5,
    Absolute = PORTOS_START + 6,
    Relative = PORTOS_START + 7,
    AboveRoot = PORTOS_START + 8,
    SymNotFound = PORTOS_START + 9,
    DsoOpen = PORTOS_START + 10,
    NotEnoughEntropy = PORTOS_START + 11,
    ProcUnknown = PORTOS_START + 12,
    General = PORTOS_START + 13,

    Acces = libc::EACCES,
    Exist = libc::EEXIST,
    Noent = libc::ENOENT,
    Notdir = libc::ENOTDIR,
    Nospc = libc::ENOSPC,
    Nomem = libc::ENOMEM,
    Mfile = libc::EMFILE,
    Nfile = libc::ENFILE,
    Badf = libc::EBADF,
    Inval = libc::EINVAL,
    Spipe = libc::ESPIPE,
    Again = libc::EAGAIN,
    Intr = libc::EINTR,
    Notsock = libc::ENOTSOCK,
    ConnRefused = libc::ECONNREFUSED,
    InProgress = libc::EINPROGRESS,
    ConnAborted = libc::ECONNABORTED,
    ConnReset = libc::ECONNRESET,
    TimedOut = libc::ETIMEDOUT,
    HostUnreach = libc::EHOSTUNREACH,
    NetUnreach = libc::ENETUNREACH,
    Pipe = libc::EPIPE,
    Xdev = libc::EXDEV,
    NotEmpty = libc::ENOTEMPTY,
    AfNoSupport = libc::EAFNOSUPPORT,
    NameTooLong = libc::ENAMETOOLONG,
    Isdir = libc::EISDIR,
    Busy = libc::EBUSY,
    Child = libc::ECHILD,
    AddrInUse = libc::EADDRINUSE,
    NotConn = libc::ENOTCONN,
}

impl StatusCode {
    /// The symbolic name reported to callers, e.g. `"EACCES"` or `"TIMEUP"`.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Eof => "EOF",
            StatusCode::TimeUp => "TIMEUP",
            StatusCode::Incomplete => "INCOMPLETE",
            StatusCode::NotImpl => "ENOTIMPL",
            StatusCode::Mismatch => "EMISMATCH",
            StatusCode::BadPath => "EBADPATH",
            StatusCode::Absolute => "EABSOLUTE",
            StatusCode::Relative => "ERELATIVE",
            StatusCode::AboveRoot => "EABOVEROOT",
            StatusCode::SymNotFound => "ESYMNOTFOUND",
            StatusCode::DsoOpen => "EDSOOPEN",
            StatusCode::NotEnoughEntropy => "ENOTENOUGHENTROPY",
            StatusCode::ProcUnknown => "EPROC_UNKNOWN",
            StatusCode::General => "EGENERAL",
            StatusCode::Acces => "EACCES",
            StatusCode::Exist => "EEXIST",
            StatusCode::Noent => "ENOENT",
            StatusCode::Notdir => "ENOTDIR",
            StatusCode::Nospc => "ENOSPC",
            StatusCode::Nomem => "ENOMEM",
            StatusCode::Mfile => "EMFILE",
            StatusCode::Nfile => "ENFILE",
            StatusCode::Badf => "EBADF",
            StatusCode::Inval => "EINVAL",
            StatusCode::Spipe => "ESPIPE",
            StatusCode::Again => "EAGAIN",
            StatusCode::Intr => "EINTR",
            StatusCode::Notsock => "ENOTSOCK",
            StatusCode::ConnRefused => "ECONNREFUSED",
            StatusCode::InProgress => "EINPROGRESS",
            StatusCode::ConnAborted => "ECONNABORTED",
            StatusCode::ConnReset => "ECONNRESET",
            StatusCode::TimedOut => "ETIMEDOUT",
            StatusCode::HostUnreach => "EHOSTUNREACH",
            StatusCode::NetUnreach => "ENETUNREACH",
            StatusCode::Pipe => "EPIPE",
            StatusCode::Xdev => "EXDEV",
            StatusCode::NotEmpty => "ENOTEMPTY",
            StatusCode::AfNoSupport => "EAFNOSUPPORT",
            StatusCode::NameTooLong => "ENAMETOOLONG",
            StatusCode::Isdir => "EISDIR",
            StatusCode::Busy => "EBUSY",
            StatusCode::Child => "ECHILD",
            StatusCode::AddrInUse => "EADDRINUSE",
            StatusCode::NotConn => "ENOTCONN",
        }
    }

    fn from_raw_errno(errno: i32) -> StatusCode {
        StatusCode::try_from(errno).unwrap_or(StatusCode::General)
    }
}

/// A failed operation: symbolic code plus human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
        }
    }

    /// End-of-stream marker. Not a backend failure; buffered readers treat it
    /// as a normal boundary.
    pub fn eof() -> Status {
        Status::new(StatusCode::Eof, "end of file")
    }

    pub fn timeup() -> Status {
        Status::new(StatusCode::TimeUp, "operation timed out")
    }

    pub fn again() -> Status {
        Status::new(StatusCode::Again, "resource temporarily unavailable")
    }

    pub fn interrupted() -> Status {
        Status::new(StatusCode::Intr, "interrupted")
    }

    pub fn not_impl(what: &str) -> Status {
        Status::new(StatusCode::NotImpl, format!("{what} is not supported here"))
    }

    /// Failure reported by every operation on an object whose native handle
    /// has been released.
    pub fn closed(kind: &str) -> Status {
        Status::new(StatusCode::Badf, format!("attempt to use a closed {kind}"))
    }

    pub fn invalid(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Inval, message)
    }

    pub fn from_errno(errno: nix::errno::Errno) -> Status {
        Status {
            code: StatusCode::from_raw_errno(errno as i32),
            message: errno.desc().to_string(),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Symbolic name of the code, the third element of the caller-facing
    /// `(nil, message, code_name)` triple.
    pub fn name(&self) -> &'static str {
        self.code.name()
    }

    pub fn is_eof(&self) -> bool {
        self.code == StatusCode::Eof
    }

    pub fn is_again(&self) -> bool {
        self.code == StatusCode::Again
    }

    pub fn is_timeup(&self) -> bool {
        self.code == StatusCode::TimeUp
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.name())
    }
}

impl std::error::Error for Status {}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Status {
        let code = match err.raw_os_error() {
            Some(errno) => StatusCode::from_raw_errno(errno),
            None => match err.kind() {
                io::ErrorKind::UnexpectedEof => StatusCode::Eof,
                io::ErrorKind::TimedOut => StatusCode::TimedOut,
                io::ErrorKind::InvalidInput => StatusCode::Inval,
                _ => StatusCode::General,
            },
        };
        Status {
            code,
            message: err.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for Status {
    fn from(errno: nix::errno::Errno) -> Status {
        Status::from_errno(errno)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_round_trip() {
        let status = Status::from_errno(nix::errno::Errno::EACCES);
        assert_eq!(status.code(), StatusCode::Acces);
        assert_eq!(status.name(), "EACCES");
        assert_eq!(status.message(), "Permission denied");
    }

    #[test]
    fn library_codes_are_not_errnos() {
        assert_eq!(StatusCode::from_raw_errno(libc::EPIPE), StatusCode::Pipe);
        let raw: i32 = StatusCode::Eof.into();
        assert!(raw >= PORTOS_START);
    }

    #[test]
    fn unknown_errno_maps_to_general() {
        assert_eq!(StatusCode::from_raw_errno(-1), StatusCode::General);
    }

    #[test]
    fn closed_message_names_the_kind() {
        let status = Status::closed("file");
        assert!(status.message().contains("closed file"));
        assert_eq!(status.code(), StatusCode::Badf);
    }

    #[test]
    fn io_error_conversion() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        let status: Status = err.into();
        assert_eq!(status.name(), "ENOENT");
    }
}

//! Error taxonomy and the packed 64-bit wire encoding (spec.md §4.6/§7,
//! SPEC_FULL.md §12). Grounded on `MdbError`/`MdbResult` from the
//! teacher's core module, redesigned from a code+message pair into a
//! struct-of-enums sum type per SPEC_FULL.md §9.

use std::fmt;

use mpool_backend::{BackendError, BackendErrorKind};

/// Failure taxonomy (spec.md §7). Discriminants start at 1 so that 0
/// remains reserved for "no error" in the packed wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidArgument = 1,
    NotFound = 2,
    AlreadyExists = 3,
    NoSpace = 4,
    Busy = 5,
    Overflow = 6,
    OutOfRange = 7,
    Corrupt = 8,
    Io = 9,
    InvalidState = 10,
}

impl ErrorKind {
    fn from_u8(v: u8) -> Option<ErrorKind> {
        use ErrorKind::*;
        Some(match v {
            1 => InvalidArgument,
            2 => NotFound,
            3 => AlreadyExists,
            4 => NoSpace,
            5 => Busy,
            6 => Overflow,
            7 => OutOfRange,
            8 => Corrupt,
            9 => Io,
            10 => InvalidState,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NoSpace => "no space",
            ErrorKind::Busy => "busy",
            ErrorKind::Overflow => "overflow",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Io => "io error",
            ErrorKind::InvalidState => "invalid state",
        };
        f.write_str(s)
    }
}

/// Names the component that raised the error (the "origin tag" of
/// spec.md §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Origin {
    Registry = 1,
    Mblock = 2,
    Mlog = 3,
    Mdc = 4,
    Mcache = 5,
    Backend = 6,
    Pool = 7,
}

impl Origin {
    fn from_u8(v: u8) -> Option<Origin> {
        use Origin::*;
        Some(match v {
            1 => Registry,
            2 => Mblock,
            3 => Mlog,
            4 => Mdc,
            5 => Mcache,
            6 => Backend,
            7 => Pool,
            _ => return None,
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::Registry => "registry",
            Origin::Mblock => "mblock",
            Origin::Mlog => "mlog",
            Origin::Mdc => "mdc",
            Origin::Mcache => "mcache",
            Origin::Backend => "backend",
            Origin::Pool => "pool",
        };
        f.write_str(s)
    }
}

/// (kind, origin, backend errno), plus a human string for `Display`. The
/// string never crosses the packed wire encoding; `pack`/`unpack` carry
/// only what spec.md's opaque 64-bit value carries.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    origin: Origin,
    errno: i32,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, origin: Origin, errno: i32, message: impl Into<String>) -> Error {
        Error { kind, origin, errno, message: message.into() }
    }

    pub fn invalid_state(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidState, origin, 0, message)
    }

    pub fn invalid_argument(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidArgument, origin, 0, message)
    }

    pub fn not_found(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::NotFound, origin, 0, message)
    }

    pub fn busy(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Busy, origin, 0, message)
    }

    pub fn corrupt(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Corrupt, origin, 0, message)
    }

    pub fn out_of_range(origin: Origin, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::OutOfRange, origin, 0, message)
    }

    pub fn overflow(origin: Origin, required: usize) -> Error {
        Error::new(ErrorKind::Overflow, origin, 0, format!("buffer too small, need {} bytes", required))
    }

    /// Lifts a backend-reported failure into the engine's error type,
    /// tagging it with the component that observed the failure.
    pub fn from_backend(origin: Origin, err: BackendError) -> Error {
        let kind = match err.kind {
            BackendErrorKind::InvalidArgument => ErrorKind::InvalidArgument,
            BackendErrorKind::NotFound => ErrorKind::NotFound,
            BackendErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            BackendErrorKind::NoSpace => ErrorKind::NoSpace,
            BackendErrorKind::OutOfRange => ErrorKind::OutOfRange,
            BackendErrorKind::Corrupt => ErrorKind::Corrupt,
            BackendErrorKind::InvalidState => ErrorKind::InvalidState,
            BackendErrorKind::Io => ErrorKind::Io,
        };
        Error::new(kind, origin, err.errno, err.message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    /// Encodes (kind, origin, errno) into the 64-bit wire value of
    /// spec.md §4.6/§7. Zero is reserved for success and is never
    /// produced here (an `Error` always represents failure).
    pub fn pack(&self) -> u64 {
        (self.kind as u64) | ((self.origin as u64) << 8) | ((self.errno as u32 as u64) << 16)
    }

    /// Decodes a wire value produced by `pack`. Returns `None` for the
    /// zero (success) code or for an unrecognized kind/origin byte.
    pub fn unpack(code: u64) -> Option<(ErrorKind, Origin, i32)> {
        if code == 0 {
            return None;
        }
        let kind = ErrorKind::from_u8((code & 0xff) as u8)?;
        let origin = Origin::from_u8(((code >> 8) & 0xff) as u8)?;
        let errno = ((code >> 16) & 0xffff_ffff) as u32 as i32;
        Some((kind, origin, errno))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] errno={}: {}", self.kind, self.origin, self.errno, self.message)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

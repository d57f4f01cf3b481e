use std::num::TryFromIntError;

use thiserror::Error;

/// Errors surfaced by the MarFS core.
///
/// Every kind carries an OS-style code via [`Error::errno`], preserving the
/// POSIX flavor of the original API surface: wrappers that need to return
/// `-1` + `errno` can do so mechanically.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    Exists(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Namespace quota exceeded")]
    QuotaExceeded,
    #[error("Target is too recent for garbage collection")]
    TooRecent,
    #[error("Operation crosses a namespace boundary")]
    CrossNamespace,
    #[error("Namespace cannot be a ghost target")]
    NsCannotBeTarget,
    #[error("Datastream break detected at file number {0}")]
    StreamBreak(u64),
    #[error("Handle was flushed and must be reopened")]
    HandleFlushed,
    #[error("Handle is in a terminal error state, only release is permitted")]
    HandleBroken,
    #[error("Rebuild left {0} damaged blocks")]
    RebuildIncomplete(u32),
    #[error("Operation skipped after a failure earlier in its chain")]
    OpSkipped,
    #[error("Malformed tag value: {0}")]
    TagFormat(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Numeric value exceeds type bounds: {0}")]
    Range(#[from] TryFromIntError),
    #[error("Numeric value out of range: {0}")]
    Overflow(String),
}

impl Error {
    /// Map this error onto its OS-style `errno` code.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc_consts::EINVAL,
            Error::NotFound(_) => libc_consts::ENOENT,
            Error::Exists(_) => libc_consts::EEXIST,
            Error::PermissionDenied(_) => libc_consts::EPERM,
            Error::QuotaExceeded => libc_consts::EDQUOT,
            Error::TooRecent => libc_consts::EAGAIN,
            Error::CrossNamespace => libc_consts::EXDEV,
            Error::NsCannotBeTarget => libc_consts::EXDEV,
            Error::StreamBreak(_) => libc_consts::ENOMSG,
            Error::HandleFlushed => libc_consts::ESTALE,
            Error::HandleBroken => libc_consts::EBADFD,
            Error::RebuildIncomplete(_) => libc_consts::EIO,
            Error::OpSkipped => libc_consts::ECANCELED,
            Error::TagFormat(_) => libc_consts::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc_consts::EIO),
            Error::Range(_) => libc_consts::ERANGE,
            Error::Overflow(_) => libc_consts::ERANGE,
        }
    }

    pub(crate) fn inval(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Error {
        Error::NotFound(msg.into())
    }

    pub(crate) fn tag(msg: impl Into<String>) -> Error {
        Error::TagFormat(msg.into())
    }
}

/// The handful of errno values the crate maps onto, kept here so the
/// library does not need a libc binding just for integer constants.
mod libc_consts {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EEXIST: i32 = 17;
    pub const EXDEV: i32 = 18;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
    pub const ENOMSG: i32 = 42;
    pub const EBADFD: i32 = 77;
    pub const ESTALE: i32 = 116;
    pub const EDQUOT: i32 = 122;
    pub const ECANCELED: i32 = 125;
}

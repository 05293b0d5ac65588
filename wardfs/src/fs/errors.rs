use std::io;

use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by every filesystem operation.
///
/// `Critical` marks a broken caller contract (for example acquiring a stream
/// slot that is already held); callers must not retry it. Everything else is
/// ordinary request-level failure.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("critical failure: {0}")]
    Critical(String),

    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
}

impl FsError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        FsError::BadRequest(message.into())
    }

    pub fn critical(message: impl Into<String>) -> Self {
        FsError::Critical(message.into())
    }

    /// Fatal errors must never be retried by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsError::Critical(_))
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::BadRequest(_) => libc::EINVAL,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Critical(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            _ => FsError::Io(err),
        }
    }
}

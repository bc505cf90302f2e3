#![forbid(unsafe_code)]
//! Error types for uxfs.
//!
//! Defines `XfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for mount-daemon response codes.

use thiserror::Error;

/// Unified error type for all uxfs operations.
#[derive(Debug, Error)]
pub enum XfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at daddr {daddr}: {detail}")]
    Corruption { daddr: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not permitted")]
    NotPermitted,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("too many links")]
    TooManyLinks,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("read-only filesystem")]
    ReadOnly,
}

impl XfsError {
    /// Convert this error into a POSIX errno suitable for daemon replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Format(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotPermitted => libc::EPERM,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::TooManyLinks => libc::EMLINK,
            Self::Invalid(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this error indicates a missing name or path component.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `XfsError`.
pub type Result<T> = std::result::Result<T, XfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(XfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(XfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(XfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(XfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(XfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(XfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(XfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(XfsError::TooManyLinks.to_errno(), libc::EMLINK);
        assert_eq!(XfsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(XfsError::NotPermitted.to_errno(), libc::EPERM);
        assert_eq!(XfsError::Invalid("loop").to_errno(), libc::EINVAL);
        assert_eq!(
            XfsError::Corruption {
                daddr: 0,
                detail: "bad magic".into()
            }
            .to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn io_error_preserves_os_errno() {
        let err = XfsError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn not_found_predicate() {
        assert!(XfsError::NotFound("a".into()).is_not_found());
        assert!(!XfsError::NoSpace.is_not_found());
    }
}

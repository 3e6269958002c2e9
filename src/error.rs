//! Error kinds shared across the crate.
//!
//! # Error policy
//! - Absence is a value: `lookup` returns `Option<FileInfo>`, never an error.
//! - Format errors carry the offending byte offset so index-build aborts can
//!   name the exact corruption site.
//! - The FUSE boundary converts every error into an errno via
//!   [`ArcError::errno`]; nothing panics across that boundary.
//! - Index invalidation is NOT an error — callers rebuild silently.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArcError {
    /// Bad user input: nonexistent path, incompatible flags, mount point
    /// that is not a directory.  Reported to stderr, exit code 1.
    #[error("{0}")]
    Usage(String),

    /// Malformed archive data.  During index build this aborts with the
    /// offending offset; during runtime reads it surfaces as EIO.
    #[error("Format error at offset {offset}: {message}")]
    Format { offset: u64, message: String },

    /// A corrupt compressed block.  Offsets inside it return EIO; the rest
    /// of the stream stays readable.
    #[error("Corrupt {codec} block at compressed offset {offset}: {message}")]
    CorruptBlock { codec: &'static str, offset: u64, message: String },

    /// The format was recognized but this build ships no backend for it.
    #[error("Recognized a {format} archive but the {format} backend is not available in this build")]
    MissingBackend { format: &'static str },

    /// Every configured password was tried and rejected.
    #[error("Could not decrypt {path}: all {tried} configured password(s) were rejected")]
    PasswordExhausted { path: String, tried: usize },

    /// Operation the mounted filesystem does not support (EROFS / ENOSYS).
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ArcError {
    /// Map to the errno reported through FUSE.
    pub fn errno(&self) -> i32 {
        match self {
            ArcError::Usage(_)                 => libc::EINVAL,
            ArcError::Format { .. }            => libc::EIO,
            ArcError::CorruptBlock { .. }      => libc::EIO,
            ArcError::MissingBackend { .. }    => libc::ENOSYS,
            ArcError::PasswordExhausted { .. } => libc::EACCES,
            ArcError::Unsupported(_)           => libc::EROFS,
            ArcError::Sql(_)                   => libc::EIO,
            ArcError::Io(e)                    => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<ArcError> for io::Error {
    fn from(e: ArcError) -> io::Error {
        match e {
            ArcError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ArcError::Usage("bad flag".into()).errno(), libc::EINVAL);
        assert_eq!(
            ArcError::Format { offset: 7, message: "truncated".into() }.errno(),
            libc::EIO
        );
        assert_eq!(
            ArcError::CorruptBlock { codec: "gzip", offset: 0, message: "crc".into() }.errno(),
            libc::EIO
        );
        assert_eq!(ArcError::MissingBackend { format: "rar" }.errno(), libc::ENOSYS);
        assert_eq!(
            ArcError::PasswordExhausted { path: "/a.zip".into(), tried: 2 }.errno(),
            libc::EACCES
        );
        assert_eq!(ArcError::Unsupported("link").errno(), libc::EROFS);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let err = ArcError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), libc::ENOSPC);

        // Round trip back into io::Error does not re-wrap the inner error.
        let back: io::Error = err.into();
        assert_eq!(back.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn format_errors_name_the_offset() {
        let err = ArcError::Format { offset: 512, message: "bad header".into() };
        assert!(err.to_string().contains("512"));
    }
}

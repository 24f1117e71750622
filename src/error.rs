// src/error.rs
//! Error handling for the streaming engine.
//!
//! - **Performance**: Enum discriminant (cheap match), allocations only on error paths.
//! - **Features**: transparent std I/O errors, `is_*` helpers, `Result` alias.
//! - Every failure is recovered locally by the scheduler; the host only ever
//!   observes a request's `Failed` status plus the `failed_requests` counter.

use std::io;
use thiserror::Error;

/// Main error type — lightweight, Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// I/O errors (most common).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Asset path could not be resolved or the file failed to open.
    #[error("asset not found: {0:#018x}")]
    NotFound(u64),

    /// Magic/version mismatch or an inconsistent LOD table.
    #[error("invalid asset header: {0}")]
    HeaderInvalid(String),

    /// Short read from disk or a failed async completion.
    #[error("read truncated: wanted {wanted} bytes, got {got}")]
    ReadTruncated { wanted: usize, got: usize },

    /// Decompression failed or produced the wrong number of bytes.
    #[error("decompression error: {0}")]
    Compression(String),

    /// Pool allocation failed after the eviction retry.
    #[error("out of memory: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// The engine is shutting down; the request was dropped.
    #[error("engine shut down")]
    Shutdown,
}

impl StreamError {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::NotFound(_))
    }

    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, StreamError::OutOfMemory { .. })
    }

    #[inline]
    pub fn is_header_invalid(&self) -> bool {
        matches!(self, StreamError::HeaderInvalid(_))
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, StreamError::Shutdown)
    }
}

/// Convenient `Result` alias — use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_helpers() {
        assert!(StreamError::NotFound(0x1234).is_not_found());
        assert!(StreamError::OutOfMemory {
            requested: 4096,
            available: 0
        }
        .is_out_of_memory());
        assert!(StreamError::Shutdown.is_shutdown());
        assert!(!StreamError::Shutdown.is_not_found());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: StreamError = io_err.into();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = StreamError::ReadTruncated {
            wanted: 4096,
            got: 17,
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("17"));
    }
}

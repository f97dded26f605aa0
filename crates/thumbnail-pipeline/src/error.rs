//! Error taxonomy for thumbnail loading, scaling and caching.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between a source file and a finished thumbnail.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    /// The source could not be opened or read (missing, permissions, empty).
    #[error("cannot read {}: {source}", origin.display())]
    SourceUnreadable {
        origin: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No registered codec claims the source bytes.
    #[error("no decoder found for {}", origin.display())]
    NoDecoderFound { origin: PathBuf },

    /// A codec claimed the bytes but failed while decoding them.
    #[error("failed to decode {}: {reason}", origin.display())]
    DecodeFailed { origin: PathBuf, reason: String },

    /// Encoding or writing a scaled image failed.
    #[error("failed to write {}: {reason}", path.display())]
    WriteFailed { path: PathBuf, reason: String },

    /// A persisted cache file exists but cannot be decoded.
    #[error("corrupt cache entry {}: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },
}

impl ThumbnailError {
    pub(crate) fn unreadable(origin: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::SourceUnreadable {
            origin: origin.into(),
            source,
        }
    }

    pub(crate) fn decode(origin: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DecodeFailed {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::WriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly name of the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnreadable { .. } => "source_unreadable",
            Self::NoDecoderFound { .. } => "no_decoder_found",
            Self::DecodeFailed { .. } => "decode_failed",
            Self::WriteFailed { .. } => "write_failed",
            Self::CacheCorrupt { .. } => "cache_corrupt",
        }
    }
}

pub type Result<T> = std::result::Result<T, ThumbnailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_path() {
        let err = ThumbnailError::NoDecoderFound {
            origin: PathBuf::from("/photos/a.xyz"),
        };
        assert_eq!(err.to_string(), "no decoder found for /photos/a.xyz");
        assert_eq!(err.kind(), "no_decoder_found");
    }

    #[test]
    fn test_unreadable_keeps_io_source() {
        let err = ThumbnailError::unreadable(
            "/missing.png",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        match &err {
            ThumbnailError::SourceUnreadable { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }
}

//! The archive-layer error taxonomy.
//!
//! Every failure the enumerator can produce is one of the kinds below, so
//! collaborators can tell archive-layer problems apart from unrelated I/O
//! errors. Kinds carry the errno and message reported by the backing layer
//! where one exists. End-of-archive is not an error: operations that can hit
//! it return `Ok(None)`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Domain identifier attached to every archive-layer error.
///
/// Collaborators that funnel errors from several subsystems into one channel
/// can use this to recognise errors originating here.
pub const ERROR_DOMAIN: &str = "arcstream";

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors produced by the archive enumerator.
///
/// The enum is `Clone` because a fatal error is latched on the cursor and
/// redelivered on the following `next_member` call.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// The archive could not be opened or its leading header is unreadable.
    /// Fatal for this archive.
    #[error("cannot open archive: {message}")]
    OpenFailed {
        /// OS errno, when the failure came from a system call.
        errno: Option<i32>,
        /// Message from the backing layer.
        message: String,
    },

    /// Reading the next entry header failed mid-stream. Terminates iteration.
    #[error("cannot read entry header: {message}")]
    HeaderError {
        /// OS errno, when the failure came from a system call.
        errno: Option<i32>,
        /// Message from the backing layer.
        message: String,
    },

    /// Reading or skipping an entry payload failed. Terminates iteration.
    #[error("cannot read entry payload: {message}")]
    DataReadError {
        /// OS errno, when the failure came from a system call.
        errno: Option<i32>,
        /// Message from the backing layer.
        message: String,
    },

    /// The entry payload exceeds the configured in-memory cap. Local: the
    /// member is still Fresh and can be skipped or extracted instead.
    #[error("payload of {size} bytes exceeds the {cap} byte cap")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u64,
        /// Configured cap (`Options::max_payload`).
        cap: u64,
    },

    /// The queried attribute was not recorded for this entry. Local: probe
    /// with the matching predicate and choose a fallback.
    #[error("entry does not carry attribute `{attribute}`")]
    MetadataUnavailable {
        /// Name of the absent attribute.
        attribute: &'static str,
    },

    /// A member was used after a later member was issued (or after the
    /// cursor was closed). Programming error.
    #[error("member was invalidated by a later next_member call")]
    MemberInvalidated,

    /// `fetch_data`/`skip_data` called on a member whose payload was already
    /// consumed. Programming error.
    #[error("payload already {consumed} for this member")]
    WrongPhase {
        /// What already happened to the payload ("fetched" or "skipped").
        consumed: &'static str,
    },

    /// `data` requested after the payload was skipped or the member
    /// invalidated without a prior fetch. Programming error.
    #[error("payload bytes were never materialized for this member")]
    DataUnavailable,

    /// The extraction destination already exists. Never overwritten.
    #[error("destination {path:?} already exists")]
    DestinationExists {
        /// The offending destination path.
        path: PathBuf,
    },

    /// Creating, writing, or linking the extraction destination failed.
    #[error("extraction failed: {message}")]
    ExtractionIOError {
        /// OS errno, when the failure came from a system call.
        errno: Option<i32>,
        /// Message from the backing layer.
        message: String,
    },

    /// A cooperative cancel was observed before the operation touched the
    /// backing layer. Expected during shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl ArchiveError {
    pub(crate) fn open_failed(err: &io::Error) -> Self {
        ArchiveError::OpenFailed {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub(crate) fn header(message: impl Into<String>) -> Self {
        ArchiveError::HeaderError {
            errno: None,
            message: message.into(),
        }
    }

    pub(crate) fn header_io(err: &io::Error) -> Self {
        ArchiveError::HeaderError {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub(crate) fn data_read(message: impl Into<String>) -> Self {
        ArchiveError::DataReadError {
            errno: None,
            message: message.into(),
        }
    }

    pub(crate) fn data_read_io(err: &io::Error) -> Self {
        ArchiveError::DataReadError {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub(crate) fn extraction(message: impl Into<String>) -> Self {
        ArchiveError::ExtractionIOError {
            errno: None,
            message: message.into(),
        }
    }

    pub(crate) fn extraction_io(err: &io::Error) -> Self {
        ArchiveError::ExtractionIOError {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    /// The error domain, for collaborators multiplexing error channels.
    #[must_use]
    pub fn domain(&self) -> &'static str {
        ERROR_DOMAIN
    }

    /// OS errno carried by this error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            ArchiveError::OpenFailed { errno, .. }
            | ArchiveError::HeaderError { errno, .. }
            | ArchiveError::DataReadError { errno, .. }
            | ArchiveError::ExtractionIOError { errno, .. } => *errno,
            _ => None,
        }
    }

    /// True for kinds that indicate a contract violation by the caller
    /// rather than a property of the archive or the filesystem.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            ArchiveError::MemberInvalidated
                | ArchiveError::WrongPhase { .. }
                | ArchiveError::DataUnavailable
        )
    }

    /// True for kinds that terminate iteration of the archive.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::OpenFailed { .. }
                | ArchiveError::HeaderError { .. }
                | ArchiveError::DataReadError { .. }
        )
    }
}

/// Non-fatal advisory raised while parsing an entry.
///
/// Warnings never fail an operation. The backing layer records at most one
/// per entry and the cursor attaches it to the next member it issues; probe
/// with [`Member::warning`](crate::Member::warning).
#[derive(Debug, Clone)]
pub struct Warning {
    message: String,
}

impl Warning {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Warning {
            message: message.into(),
        }
    }

    /// Human-readable description of the advisory.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ArchiveError::MemberInvalidated.is_misuse());
        assert!(ArchiveError::DataUnavailable.is_misuse());
        assert!(ArchiveError::WrongPhase { consumed: "fetched" }.is_misuse());
        assert!(!ArchiveError::Cancelled.is_misuse());

        assert!(ArchiveError::header("boom").is_fatal());
        assert!(ArchiveError::data_read("boom").is_fatal());
        assert!(!ArchiveError::PayloadTooLarge { size: 2, cap: 1 }.is_fatal());
        assert!(!ArchiveError::Cancelled.is_fatal());
    }

    #[test]
    fn errno_passthrough() {
        let io = io::Error::from_raw_os_error(2);
        let err = ArchiveError::header_io(&io);
        assert_eq!(err.errno(), Some(2));
        assert_eq!(ArchiveError::Cancelled.errno(), None);
        assert_eq!(err.domain(), ERROR_DOMAIN);
    }
}

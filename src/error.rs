//! Custom error types for the trawler.
//!
//! This module defines the primary error type, `TrawlerError`, together with the two
//! component-level taxonomies the pipeline reasons about: `ExtractionError` (raised by the
//! metadata extractor) and `SubmissionError` (raised by the archive ingestion client).
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! failures, from configuration issues to archive conflicts.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches.
//! - **`Configuration`**: Semantic errors in a configuration that parsed correctly.
//! - **`Io`** / **`TransientIo`**: Local filesystem failures. `TransientIo` marks failures
//!   that are expected to clear up on the next poll (buffer briefly unreadable, timeouts).
//! - **`Extraction`**: A product's container could not be turned into a metadata record.
//! - **`Submission`**: The archive did not acknowledge a product.
//! - **`ReconciliationConflict`**: The archive already holds the identifier with different
//!   content. This is surfaced for an operator and never resolved automatically.
//! - **`InvalidTransition`**: A transfer state change the state machine does not allow.
//!
//! Every variant answers [`TrawlerError::is_transient`], which the orchestrator uses to
//! decide between retrying and moving a product to `failed`.

use std::time::Duration;
use thiserror::Error;

use crate::state::TransferState;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, TrawlerError>;

/// Primary error type for the trawler.
#[derive(Error, Debug)]
pub enum TrawlerError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure expected to clear up on a later attempt.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Metadata extraction failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Archive submission failed.
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// The archive already holds this identifier with different content.
    #[error(
        "Archive already holds '{capture_id}' with different content \
         (archived digest {archived_digest}, local digest {local_digest})"
    )]
    ReconciliationConflict {
        /// Identifier of the conflicting product.
        capture_id: String,
        /// Metadata digest recorded by the archive.
        archived_digest: String,
        /// Metadata digest computed locally.
        local_digest: String,
    },

    /// A state change that the transfer state machine does not allow.
    #[error("Invalid transfer state transition for '{capture_id}': {from} -> {to}")]
    InvalidTransition {
        /// Identifier of the product.
        capture_id: String,
        /// Current state.
        from: TransferState,
        /// Requested state.
        to: TransferState,
    },

    /// Transfer state could not be loaded or persisted.
    #[error("State store error: {0}")]
    State(String),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background task panicked or was cancelled.
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for TrawlerError {
    fn from(value: figment::Error) -> Self {
        TrawlerError::Config(Box::new(value))
    }
}

impl TrawlerError {
    /// Whether the failure may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            TrawlerError::TransientIo(_) => true,
            TrawlerError::Submission(err) => err.is_transient(),
            _ => false,
        }
    }
}

// =============================================================================
// Extraction Errors
// =============================================================================

/// What went wrong while extracting metadata from a product container.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionErrorKind {
    /// The container file could not be opened or read.
    Unreadable(String),
    /// The container was read but its structure is corrupt.
    Corrupt(String),
    /// A required attribute is absent.
    MissingRequired {
        /// Record field that could not be filled.
        field: &'static str,
    },
    /// An attribute is present but its value is unusable.
    Malformed {
        /// Record field that could not be filled.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// An attribute is absent and the documented default was used instead.
    Defaulted {
        /// Record field that was defaulted.
        field: &'static str,
        /// Value written in place of the missing attribute.
        default: String,
    },
    /// The file is not one of the supported container formats.
    UnsupportedFormat(String),
    /// The container format needs a cargo feature that is not compiled in.
    FeatureNotEnabled(&'static str),
    /// Extraction exceeded its time ceiling.
    Timeout(Duration),
}

/// Error raised by the metadata extractor for one product.
///
/// Only [`ExtractionErrorKind::Defaulted`] is recoverable: the record is still produced,
/// with the documented default in place. All other kinds are fatal for the product (but
/// never for the polling cycle).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Extraction error for '{product}': {kind}")]
pub struct ExtractionError {
    /// Capture identifier or file name of the product.
    pub product: String,
    /// The failure.
    pub kind: ExtractionErrorKind,
}

impl ExtractionError {
    /// Create an error for `product`.
    pub fn new(product: impl Into<String>, kind: ExtractionErrorKind) -> Self {
        Self {
            product: product.into(),
            kind,
        }
    }

    /// True unless the error only records a defaulted field.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind, ExtractionErrorKind::Defaulted { .. })
    }
}

impl std::fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionErrorKind::Unreadable(msg) => write!(f, "container unreadable: {msg}"),
            ExtractionErrorKind::Corrupt(msg) => write!(f, "container corrupt: {msg}"),
            ExtractionErrorKind::MissingRequired { field } => {
                write!(f, "required attribute '{field}' is missing")
            }
            ExtractionErrorKind::Malformed { field, reason } => {
                write!(f, "attribute '{field}' is malformed: {reason}")
            }
            ExtractionErrorKind::Defaulted { field, default } => {
                write!(f, "attribute '{field}' is missing, defaulted to '{default}'")
            }
            ExtractionErrorKind::UnsupportedFormat(what) => write!(f, "unsupported format: {what}"),
            ExtractionErrorKind::FeatureNotEnabled(feature) => write!(
                f,
                "feature '{feature}' is not enabled. Please build with --features {feature}"
            ),
            ExtractionErrorKind::Timeout(limit) => {
                write!(f, "extraction exceeded {}", humantime::format_duration(*limit))
            }
        }
    }
}

// =============================================================================
// Submission Errors
// =============================================================================

/// Failure talking to the archive ingestion service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmissionError {
    /// Network or server-side failure; the request may or may not have been applied.
    #[error("Transient archive failure: {0}")]
    Transient(String),

    /// No response within the request timeout.
    #[error("Archive request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// The archive rejected the product or its metadata.
    #[error("Archive rejected submission: {0}")]
    Rejected(String),

    /// The archive already holds a product with this identifier.
    #[error("Archive already holds identifier '{0}'")]
    Duplicate(String),
}

impl SubmissionError {
    /// Transient failures are retried with backoff; permanent ones fail the product.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmissionError::Transient(_) | SubmissionError::Timeout(_))
    }

    /// Whether the request might have reached the archive before failing.
    ///
    /// Such outcomes must be reconciled with an existence check before retrying.
    pub fn is_ambiguous(&self) -> bool {
        self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaulted_field_is_not_fatal() {
        let err = ExtractionError::new(
            "1555862422_sdp_l0",
            ExtractionErrorKind::Defaulted {
                field: "Targets",
                default: "unknown".into(),
            },
        );
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("defaulted to 'unknown'"));
    }

    #[test]
    fn container_errors_are_fatal() {
        let unreadable =
            ExtractionError::new("x", ExtractionErrorKind::Unreadable("no such file".into()));
        let missing =
            ExtractionError::new("x", ExtractionErrorKind::MissingRequired { field: "StartTime" });
        assert!(unreadable.is_fatal());
        assert!(missing.is_fatal());
    }

    #[test]
    fn submission_error_classification() {
        assert!(SubmissionError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(SubmissionError::Transient("503".into()).is_ambiguous());
        assert!(!SubmissionError::Rejected("bad metadata".into()).is_transient());
        assert!(!SubmissionError::Duplicate("1555862422_sdp_l0".into()).is_transient());
    }

    #[test]
    fn trawler_error_transience_follows_submission() {
        let err: TrawlerError = SubmissionError::Timeout(Duration::from_secs(1)).into();
        assert!(err.is_transient());
        let err: TrawlerError = SubmissionError::Rejected("nope".into()).into();
        assert!(!err.is_transient());
        assert!(TrawlerError::TransientIo("busy".into()).is_transient());
    }
}

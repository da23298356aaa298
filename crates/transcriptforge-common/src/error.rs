//! Common error types used throughout transcriptforge.
//!
//! The variants mirror the failure taxonomy of the pipeline: per-item failures
//! that are absorbed and recorded (`TransientNetwork`, `Timeout`,
//! `RateLimited`, `ContentAbsent`), gate failures that block destructive work
//! (`CorruptArtifact`, `VerificationFailed`), and process-level failures that
//! must reach the operator (`RegistryCorrupt`, `CircuitOpen`).

use std::path::PathBuf;
use std::time::Duration;

/// Common error type for transcriptforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A network-level failure talking to an external collaborator.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// An external call exceeded its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator reported that the caller is being throttled.
    #[error("Rate limited{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited {
        /// Hint from the collaborator, if it gave one.
        retry_after: Option<Duration>,
    },

    /// The collaborator confirmed that the content does not exist.
    #[error("Content absent: {0}")]
    ContentAbsent(String),

    /// An artifact on disk failed to parse or lacks required fields.
    #[error("Corrupt artifact {path:?}: {reason}")]
    CorruptArtifact {
        /// File that failed the check.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The durable registry document is unreadable. Never reinitialized.
    #[error("Registry document {path:?} is corrupt: {reason}")]
    RegistryCorrupt {
        /// Location of the registry document.
        path: PathBuf,
        /// Parser or I/O message.
        reason: String,
    },

    /// Cleanup was refused because verification did not pass.
    #[error("Verification failed for '{collection}': {first_issue}")]
    VerificationFailed {
        /// Collection that was being verified.
        collection: String,
        /// The first itemized issue the gate reported.
        first_issue: String,
    },

    /// Too many consecutive cross-item failures; processing of the collection halted.
    #[error("Circuit open for '{collection}' during {phase}: {failures} consecutive failures")]
    CircuitOpen {
        /// Collection whose processing was halted.
        collection: String,
        /// Phase being driven when the breaker tripped.
        phase: String,
        /// Consecutive failures observed at the final trip.
        failures: u32,
    },

    /// A collection name that is not defined in configuration.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Invalid input was provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a durable document failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new TransientNetwork error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create a new ContentAbsent error.
    pub fn content_absent<S: Into<String>>(msg: S) -> Self {
        Self::ContentAbsent(msg.into())
    }

    /// Create a new CorruptArtifact error.
    pub fn corrupt_artifact<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::CorruptArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new RegistryCorrupt error.
    pub fn registry_corrupt<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::RegistryCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error must stop the whole process rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RegistryCorrupt { .. })
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::network("connection reset");
        assert_eq!(err.to_string(), "Transient network error: connection reset");

        let err = Error::content_absent("no transcript");
        assert_eq!(err.to_string(), "Content absent: no transcript");

        let err = Error::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "Rate limited");

        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "Rate limited (retry after 30s)");

        let err = Error::VerificationFailed {
            collection: "demo".into(),
            first_issue: "unit 001: no extracted-content artifact".into(),
        };
        assert_eq!(
            err.to_string(),
            "Verification failed for 'demo': unit 001: no extracted-content artifact"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_registry_corrupt_is_fatal() {
        let err = Error::registry_corrupt("/tmp/state.json", "expected value at line 1");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("state.json"));
    }

    #[test]
    fn test_error_constructors() {
        let err = Error::corrupt_artifact("a.json", "missing metadata");
        assert!(matches!(err, Error::CorruptArtifact { .. }));

        let err = Error::invalid_input("bad phase");
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

//! Transfer error types.

use bucketlift_protocol::TransferState;

/// Error reported by an [`ObjectStore`](crate::ObjectStore) operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Network failure, timeout or a retryable server-side status.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The store refused the request; retrying will not help.
    #[error("store rejected request: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors produced by the transfer controller.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid part size: {0}")]
    InvalidPartSize(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid destination key: {0}")]
    InvalidKey(String),

    #[error("source holds {actual} bytes, expected {expected}")]
    SourceSizeMismatch { expected: u64, actual: u64 },

    #[error("initiation failed: {0}")]
    Initiation(#[source] StoreError),

    #[error("part {part_number} failed after {attempts} attempt(s): {source}")]
    PartUpload {
        part_number: u32,
        attempts: u32,
        source: StoreError,
    },

    #[error("completion failed: {0}")]
    Completion(#[source] StoreError),

    #[error("parts not uploaded: {missing:?}")]
    IncompleteParts { missing: Vec<u32> },

    #[error("session {session_id} is {state:?}")]
    SessionTerminal {
        session_id: String,
        state: TransferState,
    },

    #[error("unknown part number: {0}")]
    UnknownPart(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("session {0} is older than the store retention window")]
    SessionExpired(String),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("worker error: {0}")]
    Worker(String),
}

impl TransferError {
    /// Returns `true` if the failure came from exhausting retries on a
    /// transient store error, which leaves the store-side session usable.
    pub fn is_retry_exhaustion(&self) -> bool {
        matches!(self, Self::PartUpload { source, .. } if source.is_transient())
    }
}

/// Structured result of a transfer that did not complete.
///
/// Carries enough context for the ingress layer to word a message and decide
/// whether a resume is worth offering.
#[derive(Debug, thiserror::Error)]
#[error("transfer of {destination_key} ended {state:?}: {error}")]
pub struct TransferFailure {
    /// `None` when the store never issued a session.
    pub session_id: Option<String>,
    pub destination_key: String,
    pub state: TransferState,
    #[source]
    pub error: TransferError,
    /// Failure of the cleanup abort, kept apart from the original reason.
    pub abort_error: Option<String>,
    /// `true` when the store-side session was left open for a resume.
    pub resumable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_classification() {
        assert!(StoreError::Transient("503".into()).is_transient());
        assert!(!StoreError::Permanent("403".into()).is_transient());
    }

    #[test]
    fn retry_exhaustion_only_for_transient_parts() {
        let exhausted = TransferError::PartUpload {
            part_number: 2,
            attempts: 3,
            source: StoreError::Transient("reset".into()),
        };
        assert!(exhausted.is_retry_exhaustion());

        let denied = TransferError::PartUpload {
            part_number: 2,
            attempts: 1,
            source: StoreError::Permanent("denied".into()),
        };
        assert!(!denied.is_retry_exhaustion());
        assert!(!TransferError::Cancelled.is_retry_exhaustion());
    }

    #[test]
    fn part_upload_message_names_part_and_attempts() {
        let err = TransferError::PartUpload {
            part_number: 4,
            attempts: 3,
            source: StoreError::Transient("timed out".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("part 4"));
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("timed out"));
    }
}

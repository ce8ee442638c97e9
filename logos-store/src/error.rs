//! Error taxonomy for the document store.
//!
//! Ordinary outcomes (a missing document, a lost optimistic write, a body
//! that was compacted away) are plain variants so callers can match on them
//! without tearing down an enclosing transaction. `Internal` is reserved for
//! failures nobody can act on.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Which family an error code belongs to when reported across a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Status code from the key-value engine.
    StorageEngine,
    /// HTTP-style status for document semantics (404, 409, 410, ...).
    Http,
    /// Unexpected failure inside this crate.
    Internal,
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Document, revision or raw record is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Revision exists but its body can no longer be retrieved
    #[error("Revision body gone: {0}")]
    Gone(String),

    /// Optimistic write lost against a newer revision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed revision ID or history chain
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation issued in the wrong transaction state
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Failure reported by RocksDB, including I/O
    #[error("Storage engine error ({code}): {message}")]
    StorageEngine { code: i32, message: String },

    /// Unexpected or unclassified failure (corrupt records, poisoned locks)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// The `(domain, code)` pair reported to boundary layers.
    pub fn status(&self) -> (ErrorDomain, i32) {
        match self {
            StoreError::NotFound(_) => (ErrorDomain::Http, 404),
            StoreError::Gone(_) => (ErrorDomain::Http, 410),
            StoreError::Conflict(_) => (ErrorDomain::Http, 409),
            StoreError::BadRequest(_) => (ErrorDomain::Http, 400),
            StoreError::Precondition(_) => (ErrorDomain::Http, 412),
            StoreError::StorageEngine { code, .. } => (ErrorDomain::StorageEngine, *code),
            StoreError::Internal(_) => (ErrorDomain::Internal, 2),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub(crate) fn corrupt(what: &str, detail: impl std::fmt::Display) -> Self {
        StoreError::Internal(format!("corrupt {what}: {detail}"))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        // Mirrors the numeric status codes of rocksdb::Status::Code.
        let code = match e.kind() {
            ErrorKind::NotFound => 1,
            ErrorKind::Corruption => 2,
            ErrorKind::NotSupported => 3,
            ErrorKind::InvalidArgument => 4,
            ErrorKind::IOError => 5,
            ErrorKind::Incomplete => 7,
            ErrorKind::ShutdownInProgress => 8,
            ErrorKind::TimedOut => 9,
            ErrorKind::Aborted => 10,
            ErrorKind::Busy => 11,
            _ => -1,
        };
        StoreError::StorageEngine {
            code,
            message: e.into_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_statuses() {
        assert_eq!(StoreError::NotFound("x".into()).status(), (ErrorDomain::Http, 404));
        assert_eq!(StoreError::Gone("x".into()).status(), (ErrorDomain::Http, 410));
        assert_eq!(StoreError::Conflict("x".into()).status(), (ErrorDomain::Http, 409));
        assert_eq!(StoreError::BadRequest("x".into()).status(), (ErrorDomain::Http, 400));
    }

    #[test]
    fn test_engine_and_internal_statuses() {
        let err = StoreError::StorageEngine { code: 5, message: "disk".into() };
        assert_eq!(err.status(), (ErrorDomain::StorageEngine, 5));
        assert_eq!(StoreError::Internal("boom".into()).status(), (ErrorDomain::Internal, 2));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound("doc1".into());
        assert!(err.to_string().contains("Not found"));
        assert!(err.is_not_found());

        let err = StoreError::corrupt("record header", "truncated");
        assert_eq!(err.to_string(), "Internal error: corrupt record header: truncated");
    }
}

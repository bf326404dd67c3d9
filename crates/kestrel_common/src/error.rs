use thiserror::Error;

use crate::types::InstanceId;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — malformed scan request, bad projection, unknown index
/// - `Retryable`   — rollback in flight; the caller retries at a higher level
/// - `Transient`   — timeout, cancellation, upstream unavailable
/// - `InternalBug` — storage corruption or a violated internal invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Snapshot / slice layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Snapshot creation failed on {slice}: {reason}")]
    SnapshotCreate { slice: String, reason: String },

    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Snapshot merge failed: {0}")]
    MergeFailed(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Scan-path errors delivered on reply channels.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Index not found: {0}")]
    IndexNotFound(InstanceId),

    #[error("Index not ready: {0}")]
    IndexNotReady(InstanceId),

    #[error("Index rolled back")]
    IndexRolledBack,

    #[error("Index rollback or warmup in progress")]
    IndexRollbackOrBootstrap,

    #[error("Scan timed out")]
    ScanTimedOut,

    #[error("Scan cancelled")]
    ScanCancelled,

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),
}

/// Cluster-management adapter errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Rebalance failed: {0}")]
    RebalanceFailed(String),

    #[error("Rebalance timed out after {0} seconds")]
    RebalanceTimedOut(u64),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Scan(ScanError::InvalidRequest(_)) => ErrorKind::UserError,
            KestrelError::Scan(ScanError::IndexNotFound(_)) => ErrorKind::UserError,
            KestrelError::Scan(ScanError::IndexNotReady(_)) => ErrorKind::UserError,

            KestrelError::Scan(ScanError::IndexRolledBack) => ErrorKind::Retryable,
            KestrelError::Scan(ScanError::IndexRollbackOrBootstrap) => ErrorKind::Retryable,

            KestrelError::Scan(ScanError::ScanTimedOut) => ErrorKind::Transient,
            KestrelError::Scan(ScanError::ScanCancelled) => ErrorKind::Transient,
            KestrelError::Cluster(ClusterError::UpstreamUnavailable(_)) => ErrorKind::Transient,
            KestrelError::Cluster(ClusterError::Http(_)) => ErrorKind::Transient,
            KestrelError::Cluster(ClusterError::RebalanceTimedOut(_)) => ErrorKind::Transient,

            KestrelError::Cluster(ClusterError::RebalanceFailed(_)) => ErrorKind::InternalBug,
            KestrelError::Storage(_) => ErrorKind::InternalBug,
            KestrelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Errors that must take the process down when hit during bootstrap.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KestrelError::Storage(StorageError::Corrupted(_)))
    }

    /// Emit a structured log entry for fatal errors. Called before the
    /// process exits on an unrecoverable condition.
    pub fn log_if_fatal(&self) {
        if self.is_fatal() {
            tracing::error!(
                component = self.affected_component(),
                error = %self,
                "FATAL storage condition"
            );
        }
    }

    fn affected_component(&self) -> &'static str {
        match self {
            KestrelError::Storage(_) => "storage",
            KestrelError::Scan(_) => "scan",
            KestrelError::Cluster(_) => "cluster",
            KestrelError::Internal(_) => "internal",
        }
    }

    /// Add context string to an error, preserving classification where the
    /// variant allows it.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::Storage(StorageError::RollbackFailed(msg)) => {
                KestrelError::Storage(StorageError::RollbackFailed(format!("{ctx}: {msg}")))
            }
            KestrelError::Storage(StorageError::MergeFailed(msg)) => {
                KestrelError::Storage(StorageError::MergeFailed(format!("{ctx}: {msg}")))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_is_user_error() {
        let e: KestrelError = ScanError::InvalidRequest("bad projection".into()).into();
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.is_user_error());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_rolled_back_is_retryable() {
        let e: KestrelError = ScanError::IndexRolledBack.into();
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_timeout_is_transient() {
        let e: KestrelError = ScanError::ScanTimedOut.into();
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let e: KestrelError = StorageError::Corrupted("snapshot header".into()).into();
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.is_fatal());
    }

    #[test]
    fn test_merge_failed_is_not_fatal_to_process() {
        let e: KestrelError = StorageError::MergeFailed("ts mismatch".into()).into();
        assert!(!e.is_fatal());
        assert_eq!(e.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_with_context_prefixes() {
        let e = KestrelError::Internal("boom".into()).with_context("stage=publish");
        assert!(e.to_string().contains("stage=publish"));
        assert!(e.to_string().contains("boom"));
    }
}

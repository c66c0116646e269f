//! Error kinds surfaced to callers of the Relatedness Core (spec.md §7).
//!
//! One enum, one `tracing` event at the point each variant is constructed —
//! the same discipline the teacher's `AppError` applies in `into_response`,
//! generalized here to a library that never renders an HTTP response: the
//! caller gets a typed error and diagnostics, never a panic or an exception.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelatednessError {
    /// Seed id absent in the tracker.
    #[error("work item {0} not found")]
    NotFound(i64),

    /// Connectivity or auth failure before any slice returned.
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// All embedding batches failed and the hash fallback is disabled.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Persisted index files failed an integrity check.
    #[error("index corrupt at {path}: {reason}")]
    IndexCorrupt { path: String, reason: String },

    /// Request deadline exceeded before any ranked item was produced.
    #[error("request timed out before producing results")]
    Timeout,

    /// An invariant was violated (e.g. vector dimension mismatch).
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelatednessError>;

impl RelatednessError {
    /// Construct and log in one step, matching the teacher's convention of
    /// logging at classification time rather than at the call site.
    pub fn not_found(id: i64) -> Self {
        tracing::warn!(seed_id = id, "seed work item not found");
        Self::NotFound(id)
    }

    pub fn tracker_unavailable(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "tracker unavailable");
        Self::TrackerUnavailable(msg)
    }

    pub fn embedding_unavailable(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "embedding provider unavailable");
        Self::EmbeddingUnavailable(msg)
    }

    pub fn index_corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        tracing::error!(path = %path, reason = %reason, "index corrupt");
        Self::IndexCorrupt { path, reason }
    }

    pub fn timeout() -> Self {
        tracing::warn!("request deadline exceeded before any ranked item was produced");
        Self::Timeout
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "internal invariant violation");
        Self::Internal(msg)
    }
}

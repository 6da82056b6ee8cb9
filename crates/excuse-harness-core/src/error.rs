//! Error taxonomy shared by every pipeline component.
//!
//! [`PipelineError`] is `Clone` so that a single failed computation can be
//! handed to every waiter of a single-flight cache key, and so a run can
//! keep its abort reason in its snapshot. [`ErrorKind`] is the flat,
//! configurable view used by retry policies.

use serde::{Deserialize, Serialize};

/// Convenience alias for results carrying a [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Flat error classification, used for retry configuration and for the
/// machine-readable `code` of API error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InsufficientSources,
    ComputationFailed,
    CacheUnavailable,
    MemoryUnavailable,
    CapabilityUnavailable,
    CapabilityDisabled,
    RateLimited,
    EvidenceUnavailable,
    SourceTimeout,
    SourceError,
    NoViableCandidates,
    StageTimeout,
    Cancelled,
    ReviewRejected,
    InvalidState,
    RunNotFound,
}

impl ErrorKind {
    /// Snake-case code, e.g. `"rate_limited"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InsufficientSources => "insufficient_sources",
            ErrorKind::ComputationFailed => "computation_failed",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::MemoryUnavailable => "memory_unavailable",
            ErrorKind::CapabilityUnavailable => "capability_unavailable",
            ErrorKind::CapabilityDisabled => "capability_disabled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::EvidenceUnavailable => "evidence_unavailable",
            ErrorKind::SourceTimeout => "source_timeout",
            ErrorKind::SourceError => "source_error",
            ErrorKind::NoViableCandidates => "no_viable_candidates",
            ErrorKind::StageTimeout => "stage_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ReviewRejected => "review_rejected",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::RunNotFound => "run_not_found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the pipeline can surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("insufficient sources: {succeeded} of {required} required sources succeeded ({})", .failures.join("; "))]
    InsufficientSources {
        succeeded: usize,
        required: usize,
        failures: Vec<String>,
    },

    #[error("computation failed: {cause}")]
    ComputationFailed { cause: Box<PipelineError> },

    #[error("cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("vector memory unavailable: {reason}")]
    MemoryUnavailable { reason: String },

    #[error("capability '{capability}' unavailable: {reason}")]
    CapabilityUnavailable { capability: String, reason: String },

    /// Turned off by configuration; retrying cannot help.
    #[error("capability '{capability}' disabled: {reason}")]
    CapabilityDisabled { capability: String, reason: String },

    #[error("capability '{capability}' rate limited")]
    RateLimited { capability: String },

    #[error("evidence unavailable: {reason}")]
    EvidenceUnavailable { reason: String },

    #[error("source '{source_name}' timed out after {timeout_ms}ms")]
    SourceTimeout { source_name: String, timeout_ms: u64 },

    #[error("source '{source_name}' failed: {reason}")]
    SourceError { source_name: String, reason: String },

    #[error("generation produced no viable candidates")]
    NoViableCandidates,

    #[error("stage '{stage}' timed out")]
    StageTimeout { stage: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("draft rejected by reviewer")]
    ReviewRejected,

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
}

impl PipelineError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        PipelineError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn cache_unavailable(reason: impl std::fmt::Display) -> Self {
        PipelineError::CacheUnavailable {
            reason: reason.to_string(),
        }
    }

    pub fn memory_unavailable(reason: impl std::fmt::Display) -> Self {
        PipelineError::MemoryUnavailable {
            reason: reason.to_string(),
        }
    }

    pub fn capability_unavailable(
        capability: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        PipelineError::CapabilityUnavailable {
            capability: capability.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an error produced inside a cache compute function.
    ///
    /// Already-wrapped errors are returned unchanged so nesting never grows
    /// past one level.
    pub fn computation_failed(cause: PipelineError) -> Self {
        match cause {
            PipelineError::ComputationFailed { .. } => cause,
            other => PipelineError::ComputationFailed {
                cause: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            PipelineError::InsufficientSources { .. } => ErrorKind::InsufficientSources,
            PipelineError::ComputationFailed { .. } => ErrorKind::ComputationFailed,
            PipelineError::CacheUnavailable { .. } => ErrorKind::CacheUnavailable,
            PipelineError::MemoryUnavailable { .. } => ErrorKind::MemoryUnavailable,
            PipelineError::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            PipelineError::CapabilityDisabled { .. } => ErrorKind::CapabilityDisabled,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::EvidenceUnavailable { .. } => ErrorKind::EvidenceUnavailable,
            PipelineError::SourceTimeout { .. } => ErrorKind::SourceTimeout,
            PipelineError::SourceError { .. } => ErrorKind::SourceError,
            PipelineError::NoViableCandidates => ErrorKind::NoViableCandidates,
            PipelineError::StageTimeout { .. } => ErrorKind::StageTimeout,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::ReviewRejected => ErrorKind::ReviewRejected,
            PipelineError::InvalidState { .. } => ErrorKind::InvalidState,
            PipelineError::RunNotFound { .. } => ErrorKind::RunNotFound,
        }
    }

    /// The innermost error, looking through `ComputationFailed`.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::ComputationFailed { cause } => cause.root(),
            other => other,
        }
    }

    /// Kind of the innermost error.
    pub fn root_kind(&self) -> ErrorKind {
        self.root().kind()
    }
}

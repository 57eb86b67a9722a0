//! Error types for the orchestration domain.

use corso_core::CourseId;

use crate::repair::RepairAttempt;
use crate::state::CourseState;

/// The result type used throughout corso-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A course was not found.
    #[error("course not found: {course_id}")]
    CourseNotFound {
        /// The course ID that was not found.
        course_id: CourseId,
    },

    /// An invalid state transition was attempted.
    ///
    /// This is always fatal to the write that attempted it; callers must
    /// never downgrade it to a warning and proceed.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidTransition {
        /// The current state.
        from: CourseState,
        /// The attempted target state.
        to: CourseState,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Every enabled repair layer failed to produce a valid structured result.
    #[error("repair cascade exhausted after {} attempt(s)", attempts.len())]
    RepairExhausted {
        /// History of repair attempts (layer, model, error), in order.
        attempts: Vec<RepairAttempt>,
    },

    /// Generated content scored below the quality threshold.
    #[error("quality gate failed: overall score {overall:.3} below threshold {threshold:.3}")]
    QualityGateFailed {
        /// The weighted overall similarity score.
        overall: f64,
        /// The (language-adjusted) threshold that was applied.
        threshold: f64,
    },

    /// Timed out waiting for a concurrent request with the same idempotency
    /// key to finish.
    #[error("timed out waiting for in-progress request with idempotency key '{key}'")]
    IdempotencyTimeout {
        /// The idempotency key that was contended.
        key: String,
    },

    /// An idempotency key was reused with a different request payload.
    #[error("idempotency key '{key}' was already used with a different request payload")]
    IdempotencyKeyReuse {
        /// The reused idempotency key.
        key: String,
    },

    /// An external service (LLM or embedding) was unreachable or timed out.
    ///
    /// This is the only retryable error class at the worker; everything else
    /// is a permanent stage failure.
    #[error("{service} unavailable: {message}")]
    ServiceUnavailable {
        /// Which service failed ("completion" or "embedding").
        service: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from corso-core.
    #[error("core error: {0}")]
    Core(#[from] corso_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new service-unavailable error.
    #[must_use]
    pub fn service_unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service,
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and the operation may be
    /// retried with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::RepairLayer;

    #[test]
    fn invalid_transition_display() {
        let err = Error::InvalidTransition {
            from: CourseState::OutlineComplete,
            to: CourseState::OutlineInit,
            reason: "pipeline stages cannot be re-entered".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("outline_complete"));
        assert!(msg.contains("outline_init"));
        assert!(msg.contains("re-entered"));
    }

    #[test]
    fn repair_exhausted_reports_attempt_count() {
        let err = Error::RepairExhausted {
            attempts: vec![
                RepairAttempt::failed(RepairLayer::AutoRepair, None, "unbalanced braces"),
                RepairAttempt::failed(RepairLayer::CritiqueRevise, None, "still invalid"),
            ],
        };
        assert!(err.to_string().contains("2 attempt(s)"));
    }

    #[test]
    fn only_service_unavailable_is_retryable() {
        assert!(Error::service_unavailable("completion", "timeout").is_retryable());
        assert!(!Error::storage("oops").is_retryable());
        assert!(
            !Error::QualityGateFailed {
                overall: 0.4,
                threshold: 0.75
            }
            .is_retryable()
        );
    }
}

//! Course entity tracking.
//!
//! A course is the unit of work progressing through the generation
//! pipeline. The entity row is the single source of truth for "what stage
//! is this in": it is mutated only through validated state transitions, and
//! its `version` is bumped on every accepted transition so that a worker
//! operating on stale state fails the write instead of corrupting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corso_core::{CourseId, OrganizationId};

use crate::error::{Error, Result};
use crate::state::{CourseState, PipelineStage};

/// The error retained on a course that reached the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    /// The stage that failed, if the failure happened inside a stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    /// Human-readable failure description.
    pub message: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl StageFailure {
    /// Creates a new stage failure record.
    #[must_use]
    pub fn new(stage: Option<PipelineStage>, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            failed_at: Utc::now(),
        }
    }
}

/// User-supplied course metadata captured at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseMetadata {
    /// Course title.
    pub title: String,
    /// Content language as a lowercase ISO 639-1 tag (e.g. "en", "de").
    ///
    /// The quality gate applies a threshold adjustment for non-English
    /// content because cross-lingual embedding similarity runs lower.
    pub language: String,
}

impl CourseMetadata {
    /// Creates new course metadata.
    #[must_use]
    pub fn new(title: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            language: language.into(),
        }
    }
}

/// A course progressing through the generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    /// Unique course identifier.
    pub id: CourseId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Course metadata.
    pub metadata: CourseMetadata,
    /// Current pipeline state.
    pub state: CourseState,
    /// Monotonically increasing version, bumped on every accepted
    /// transition. Serves as the optimistic-concurrency token.
    pub version: u64,
    /// User who created the course.
    pub created_by: String,
    /// When the course was created.
    pub created_at: DateTime<Utc>,
    /// When the course was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Retained error once the course reaches `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StageFailure>,
}

impl Course {
    /// Creates a new course in the `pending` state.
    #[must_use]
    pub fn new(
        id: CourseId,
        organization_id: OrganizationId,
        metadata: CourseMetadata,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            organization_id,
            metadata,
            state: CourseState::Pending,
            version: 1,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Returns true if the course is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to a new state, bumping the version.
    ///
    /// Returns `Ok(false)` for a self-transition, which is a no-op: the
    /// version is not bumped and callers must not append an audit event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transition is not in the
    /// pipeline state machine. The course is left unchanged.
    #[tracing::instrument(skip(self), fields(course_id = %self.id, from = %self.state, to = %target))]
    pub fn transition_to(&mut self, target: CourseState) -> Result<bool> {
        if self.state == target {
            return Ok(false);
        }

        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: target,
                reason: self.state.denial_reason(target).to_string(),
            });
        }

        // A restart clears the retained failure from the previous attempt.
        if target == CourseState::Pending {
            self.last_error = None;
        }

        self.state = target;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(true)
    }

    /// Records the failure retained when the course reaches `failed`.
    pub fn record_failure(&mut self, failure: StageFailure) {
        self.last_error = Some(failure);
    }
}

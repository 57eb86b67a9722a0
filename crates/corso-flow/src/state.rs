//! Course state machine and pipeline topology.
//!
//! This module provides:
//! - `PipelineStage`: the fixed, ordered set of generation stages
//! - `CourseState`: the stage-qualified state machine for a course
//!
//! ## Design
//!
//! The valid-transition table is *derived* from the pipeline topology rather
//! than written out pair by pair. Each stage contributes an `_init`, a
//! `_processing`, and a `_complete` state; the only forward edge out of
//! stage N's `_complete` state is stage N+1's `_init` state. There is
//! deliberately no generic state reachable from every other state: allowing
//! arbitrary backward jumps destroys the ability to reason about pipeline
//! progress from the state field alone.
//!
//! ```text
//! pending ──► outline_init ──► outline_processing ──► outline_complete
//!                                                            │
//!             sections_init ◄────────────────────────────────┘
//!                  │
//!                  ▼
//!             sections_processing ──► sections_complete ──► assessments_init
//!                                                                 │
//!                                                                 ▼
//!             assessments_processing ──► assessments_complete ──► finalizing
//!                                                                      │
//!                                                                      ▼
//!                                                                  completed
//! ```
//!
//! `failed` and `cancelled` are reachable from every non-terminal state;
//! terminal states (`completed`, `failed`, `cancelled`) only permit a full
//! restart back to `pending`.

use serde::{Deserialize, Serialize};

/// A stage of the course-generation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Course metadata and section outline generation.
    Outline,
    /// Per-section lesson content generation.
    Sections,
    /// Per-section assessment generation.
    Assessments,
}

impl PipelineStage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 3] = [Self::Outline, Self::Sections, Self::Assessments];

    /// Returns the first stage of the pipeline.
    #[must_use]
    pub const fn first() -> Self {
        Self::Outline
    }

    /// Returns the stage that follows this one, or `None` for the last stage.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Outline => Some(Self::Sections),
            Self::Sections => Some(Self::Assessments),
            Self::Assessments => None,
        }
    }

    /// Returns the stage that precedes this one, or `None` for the first.
    #[must_use]
    pub const fn prev(&self) -> Option<Self> {
        match self {
            Self::Outline => None,
            Self::Sections => Some(Self::Outline),
            Self::Assessments => Some(Self::Sections),
        }
    }

    /// Returns the state a course rests in before entering this stage:
    /// the previous stage's `_complete` state, or `pending` for the first
    /// stage.
    #[must_use]
    pub const fn pre_init_state(&self) -> CourseState {
        match self.prev() {
            Some(prev) => prev.complete_state(),
            None => CourseState::Pending,
        }
    }

    /// Returns the outbox queue consumed by this stage's workers.
    #[must_use]
    pub const fn queue_name(&self) -> &'static str {
        match self {
            Self::Outline => "course.outline",
            Self::Sections => "course.sections",
            Self::Assessments => "course.assessments",
        }
    }

    /// Resolves a queue name back to its stage.
    #[must_use]
    pub fn for_queue(queue_name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.queue_name() == queue_name)
    }

    /// Returns this stage's `_init` state.
    #[must_use]
    pub const fn init_state(&self) -> CourseState {
        match self {
            Self::Outline => CourseState::OutlineInit,
            Self::Sections => CourseState::SectionsInit,
            Self::Assessments => CourseState::AssessmentsInit,
        }
    }

    /// Returns this stage's in-progress state.
    #[must_use]
    pub const fn processing_state(&self) -> CourseState {
        match self {
            Self::Outline => CourseState::OutlineProcessing,
            Self::Sections => CourseState::SectionsProcessing,
            Self::Assessments => CourseState::AssessmentsProcessing,
        }
    }

    /// Returns this stage's `_complete` state.
    #[must_use]
    pub const fn complete_state(&self) -> CourseState {
        match self {
            Self::Outline => CourseState::OutlineComplete,
            Self::Sections => CourseState::SectionsComplete,
            Self::Assessments => CourseState::AssessmentsComplete,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Outline => "outline",
            Self::Sections => "sections",
            Self::Assessments => "assessments",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a state sits relative to the pipeline topology.
///
/// Used internally to derive the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateRole {
    Pending,
    Init(PipelineStage),
    Processing(PipelineStage),
    Complete(PipelineStage),
    Finalizing,
    Terminal,
}

/// Course state machine states, stage-qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseState {
    /// Created, no stage work enqueued yet (also the restart target).
    Pending,
    /// Outline stage job enqueued, not yet picked up.
    OutlineInit,
    /// Outline stage actively executing.
    OutlineProcessing,
    /// Outline stage finished successfully.
    OutlineComplete,
    /// Sections stage job enqueued.
    SectionsInit,
    /// Sections stage actively executing.
    SectionsProcessing,
    /// Sections stage finished successfully.
    SectionsComplete,
    /// Assessments stage job enqueued.
    AssessmentsInit,
    /// Assessments stage actively executing.
    AssessmentsProcessing,
    /// Assessments stage finished successfully.
    AssessmentsComplete,
    /// All stages done, assembling the final course artifact.
    Finalizing,
    /// Every stage's quality gate and repair cascade resolved successfully.
    Completed,
    /// A stage failed permanently; the error is retained on the course.
    Failed,
    /// Explicitly cancelled; in-flight workers must abort.
    Cancelled,
}

impl CourseState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the pipeline stage this state belongs to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::OutlineInit | Self::OutlineProcessing | Self::OutlineComplete => {
                Some(PipelineStage::Outline)
            }
            Self::SectionsInit | Self::SectionsProcessing | Self::SectionsComplete => {
                Some(PipelineStage::Sections)
            }
            Self::AssessmentsInit | Self::AssessmentsProcessing | Self::AssessmentsComplete => {
                Some(PipelineStage::Assessments)
            }
            _ => None,
        }
    }

    const fn role(&self) -> StateRole {
        match self {
            Self::Pending => StateRole::Pending,
            Self::OutlineInit => StateRole::Init(PipelineStage::Outline),
            Self::OutlineProcessing => StateRole::Processing(PipelineStage::Outline),
            Self::OutlineComplete => StateRole::Complete(PipelineStage::Outline),
            Self::SectionsInit => StateRole::Init(PipelineStage::Sections),
            Self::SectionsProcessing => StateRole::Processing(PipelineStage::Sections),
            Self::SectionsComplete => StateRole::Complete(PipelineStage::Sections),
            Self::AssessmentsInit => StateRole::Init(PipelineStage::Assessments),
            Self::AssessmentsProcessing => StateRole::Processing(PipelineStage::Assessments),
            Self::AssessmentsComplete => StateRole::Complete(PipelineStage::Assessments),
            Self::Finalizing => StateRole::Finalizing,
            Self::Completed | Self::Failed | Self::Cancelled => StateRole::Terminal,
        }
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// A self-transition is always valid; it is treated as a no-op by the
    /// store and appends no audit event.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if *self == target {
            return true;
        }

        // Failure and cancellation are reachable from any non-terminal state.
        if matches!(target, Self::Failed | Self::Cancelled) {
            return !self.is_terminal();
        }

        match self.role() {
            StateRole::Pending => target == PipelineStage::first().init_state(),
            StateRole::Init(stage) => target == stage.processing_state(),
            StateRole::Processing(stage) => target == stage.complete_state(),
            StateRole::Complete(stage) => match stage.next() {
                Some(next) => target == next.init_state(),
                None => target == Self::Finalizing,
            },
            StateRole::Finalizing => target == Self::Completed,
            StateRole::Terminal => target == Self::Pending,
        }
    }

    /// Explains why a transition is denied, for error messages.
    #[must_use]
    pub fn denial_reason(&self, target: Self) -> &'static str {
        if self.is_terminal() {
            "terminal states only permit a restart to pending"
        } else if matches!(self.role(), StateRole::Complete(_))
            && matches!(target.role(), StateRole::Init(_) | StateRole::Processing(_))
            && target <= *self
        {
            "pipeline stages cannot be skipped or re-entered"
        } else {
            "transition is not in the pipeline state machine"
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OutlineInit => "outline_init",
            Self::OutlineProcessing => "outline_processing",
            Self::OutlineComplete => "outline_complete",
            Self::SectionsInit => "sections_init",
            Self::SectionsProcessing => "sections_processing",
            Self::SectionsComplete => "sections_complete",
            Self::AssessmentsInit => "assessments_init",
            Self::AssessmentsProcessing => "assessments_processing",
            Self::AssessmentsComplete => "assessments_complete",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for CourseState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for CourseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Ordering is declaration order, which matches pipeline order; used only
// for the backward-jump diagnostic in `denial_reason`.
impl PartialOrd for CourseState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CourseState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_topology_is_linear() {
        assert_eq!(PipelineStage::first(), PipelineStage::Outline);
        assert_eq!(PipelineStage::Outline.next(), Some(PipelineStage::Sections));
        assert_eq!(
            PipelineStage::Sections.next(),
            Some(PipelineStage::Assessments)
        );
        assert_eq!(PipelineStage::Assessments.next(), None);

        for stage in PipelineStage::ALL {
            match stage.prev() {
                Some(prev) => assert_eq!(prev.next(), Some(stage)),
                None => assert_eq!(stage, PipelineStage::first()),
            }
        }
        assert_eq!(PipelineStage::Outline.pre_init_state(), CourseState::Pending);
        assert_eq!(
            PipelineStage::Sections.pre_init_state(),
            CourseState::OutlineComplete
        );
    }

    #[test]
    fn queue_names_roundtrip() {
        for stage in PipelineStage::ALL {
            assert_eq!(PipelineStage::for_queue(stage.queue_name()), Some(stage));
        }
        assert_eq!(PipelineStage::for_queue("course.unknown"), None);
    }

    #[test]
    fn happy_path_is_permitted() {
        let path = [
            CourseState::Pending,
            CourseState::OutlineInit,
            CourseState::OutlineProcessing,
            CourseState::OutlineComplete,
            CourseState::SectionsInit,
            CourseState::SectionsProcessing,
            CourseState::SectionsComplete,
            CourseState::AssessmentsInit,
            CourseState::AssessmentsProcessing,
            CourseState::AssessmentsComplete,
            CourseState::Finalizing,
            CourseState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn backward_jumps_are_rejected() {
        assert!(!CourseState::SectionsComplete.can_transition_to(CourseState::SectionsInit));
        assert!(!CourseState::OutlineComplete.can_transition_to(CourseState::Pending));
        assert!(!CourseState::AssessmentsInit.can_transition_to(CourseState::OutlineProcessing));
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(!CourseState::OutlineComplete.can_transition_to(CourseState::AssessmentsInit));
        assert!(!CourseState::Pending.can_transition_to(CourseState::SectionsInit));
    }

    #[test]
    fn failure_and_cancellation_reachable_from_non_terminal() {
        for state in [
            CourseState::Pending,
            CourseState::OutlineProcessing,
            CourseState::SectionsComplete,
            CourseState::Finalizing,
        ] {
            assert!(state.can_transition_to(CourseState::Failed));
            assert!(state.can_transition_to(CourseState::Cancelled));
        }
    }

    #[test]
    fn terminal_states_only_permit_restart() {
        for terminal in [
            CourseState::Completed,
            CourseState::Failed,
            CourseState::Cancelled,
        ] {
            assert!(terminal.can_transition_to(CourseState::Pending));
            assert!(!terminal.can_transition_to(CourseState::OutlineInit));
        }
        // Terminal courses cannot be failed or cancelled after the fact.
        assert!(!CourseState::Completed.can_transition_to(CourseState::Failed));
        assert!(!CourseState::Failed.can_transition_to(CourseState::Cancelled));
        // A stale worker must not overwrite a cancellation.
        assert!(!CourseState::Cancelled.can_transition_to(CourseState::SectionsComplete));
    }

    #[test]
    fn self_transition_is_always_valid() {
        for state in [
            CourseState::Pending,
            CourseState::OutlineProcessing,
            CourseState::Completed,
            CourseState::Cancelled,
        ] {
            assert!(state.can_transition_to(state));
        }
    }

    #[test]
    fn states_serialize_snake_case() {
        let json = serde_json::to_string(&CourseState::SectionsProcessing).unwrap();
        assert_eq!(json, "\"sections_processing\"");
        let parsed: CourseState = serde_json::from_str("\"assessments_complete\"").unwrap();
        assert_eq!(parsed, CourseState::AssessmentsComplete);
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(CourseState::OutlineInit.to_string(), "outline_init");
        assert_eq!(CourseState::Finalizing.to_string(), "finalizing");
    }
}

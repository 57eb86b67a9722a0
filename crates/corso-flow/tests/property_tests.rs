//! Property-based tests for state-machine and repair invariants.

use proptest::prelude::*;

use corso_flow::schema::{FieldKind, OutputSchema};
use corso_flow::state::{CourseState, PipelineStage};

const ALL_STATES: [CourseState; 14] = [
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
    CourseState::Failed,
    CourseState::Cancelled,
];

fn arb_state() -> impl Strategy<Value = CourseState> {
    prop::sample::select(ALL_STATES.to_vec())
}

proptest! {
    /// Self-transitions are always permitted (as no-ops).
    #[test]
    fn self_transitions_allowed(state in arb_state()) {
        prop_assert!(state.can_transition_to(state));
    }

    /// Failure and cancellation are reachable from exactly the
    /// non-terminal states.
    #[test]
    fn failure_reachability(state in arb_state()) {
        let to_failed = state.can_transition_to(CourseState::Failed);
        let to_cancelled = state.can_transition_to(CourseState::Cancelled);
        if state.is_terminal() {
            prop_assert_eq!(to_failed, state == CourseState::Failed);
            prop_assert_eq!(to_cancelled, state == CourseState::Cancelled);
        } else {
            prop_assert!(to_failed);
            prop_assert!(to_cancelled);
        }
    }

    /// Terminal states permit only the restart to pending (besides the
    /// self no-op).
    #[test]
    fn terminal_states_only_restart(state in arb_state(), target in arb_state()) {
        if state.is_terminal() && state.can_transition_to(target) {
            prop_assert!(target == state || target == CourseState::Pending);
        }
    }

    /// A stage's `_complete` state reaches only the next stage's `_init`
    /// (or `finalizing` for the last stage), plus failure/cancellation.
    #[test]
    fn strict_stage_ordering(target in arb_state()) {
        for stage in PipelineStage::ALL {
            let from = stage.complete_state();
            if !from.can_transition_to(target) || target == from {
                continue;
            }
            let forward = match stage.next() {
                Some(next) => next.init_state(),
                None => CourseState::Finalizing,
            };
            prop_assert!(
                target == forward
                    || target == CourseState::Failed
                    || target == CourseState::Cancelled,
                "{} must not reach {}", from, target
            );
        }
    }

    /// No transition ever skips a stage: a reachable `_init` state always
    /// belongs to the stage right after the one the source state is in.
    #[test]
    fn no_stage_skipping(from in arb_state(), target in arb_state()) {
        if from == target || !from.can_transition_to(target) {
            return Ok(());
        }
        if let Some(target_stage) = target.stage() {
            if target == target_stage.init_state() {
                prop_assert_eq!(from, target_stage.pre_init_state());
            }
        }
    }

    /// Layer-1 auto-repair is deterministic: the same malformed input
    /// yields the same output on every call.
    #[test]
    fn auto_repair_is_deterministic(raw in ".{0,200}") {
        let schema = OutputSchema::new("course_outline")
            .field("title", FieldKind::String)
            .field("description", FieldKind::String)
            .field("sections", FieldKind::Array);
        let first = corso_flow::repair::auto::auto_repair(&raw, &schema);
        let second = corso_flow::repair::auto::auto_repair(&raw, &schema);
        prop_assert_eq!(first, second);
    }
}

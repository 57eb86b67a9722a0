//! FSM audit events.
//!
//! Every accepted state transition appends exactly one immutable event to
//! the audit log, in the same transaction as the transition itself. Events
//! are used for observability and debugging, never for control flow.
//!
//! ## Envelope
//!
//! Event envelopes follow the [`CloudEvents` v1.0 shape](https://cloudevents.io/):
//! - `id`: Unique event identifier (ULID)
//! - `source`: Event origin URI (`/corso/flow/{organization}`)
//! - `specversion`: `CloudEvents` spec version ("1.0")
//! - `type`: Event type (`corso.flow.state_changed`)
//! - `time`: Event timestamp
//!
//! ## Why ULID for Event IDs
//!
//! ULIDs sort lexicographically in creation order, so listing an audit log
//! by identifier equals listing it chronologically. Within one course the
//! `sequence` field provides the authoritative total order for replay.
//!
//! ## Idempotency
//!
//! Each event carries a deterministic `idempotency_key` derived from
//! `(course_id, sequence, old_state, new_state)` so that replay consumers
//! can deduplicate redelivered envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corso_core::{CourseId, EventId, OrganizationId};

use crate::state::CourseState;

/// Who initiated a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The public API layer (course creation, cancellation).
    Api,
    /// A queue-driven automation (scheduled restarts, sweepers).
    Queue,
    /// A pipeline worker advancing a stage.
    Worker,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => f.write_str("api"),
            Self::Queue => f.write_str("queue"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// An immutable audit record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmEvent {
    /// Unique event identifier (ULID).
    pub id: EventId,

    /// Event origin URI. Format: `/corso/flow/{organization}`.
    pub source: String,

    /// `CloudEvents` specification version.
    pub specversion: String,

    /// Event type. Always `corso.flow.state_changed`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event timestamp.
    pub time: DateTime<Utc>,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// The course whose state changed.
    pub course_id: CourseId,

    /// State before the transition.
    pub old_state: CourseState,

    /// State after the transition.
    pub new_state: CourseState,

    /// Who initiated the transition.
    pub actor: Actor,

    /// Per-course sequence number (1-indexed). The authoritative total
    /// order of this course's audit log.
    pub sequence: u64,

    /// Deterministic key for replay deduplication.
    pub idempotency_key: String,
}

impl FsmEvent {
    /// Event type constant.
    pub const STATE_CHANGED: &'static str = "corso.flow.state_changed";

    /// Creates a state-changed event.
    #[must_use]
    pub fn state_changed(
        organization_id: OrganizationId,
        course_id: CourseId,
        old_state: CourseState,
        new_state: CourseState,
        actor: Actor,
        sequence: u64,
    ) -> Self {
        let idempotency_key = format!("{course_id}:{sequence}:{old_state}->{new_state}");
        Self {
            id: EventId::generate(),
            source: format!("/corso/flow/{organization_id}"),
            specversion: "1.0".into(),
            event_type: Self::STATE_CHANGED.into(),
            time: Utc::now(),
            organization_id,
            course_id,
            old_state,
            new_state,
            actor,
            sequence,
            idempotency_key,
        }
    }
}

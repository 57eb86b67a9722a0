//! Pluggable storage for orchestration state.
//!
//! The [`Store`] trait defines the persistence layer for courses, outbox
//! entries, idempotency markers, and the audit log.
//!
//! ## Design Principles
//!
//! - **Transactional transitions**: a state change, its outbox entries, its
//!   audit event, and the consumption of the triggering entry commit
//!   together or not at all — partial application is never observable
//! - **Optimistic concurrency**: a transition is validated against the
//!   *currently stored* state inside the transaction, so a caller holding a
//!   stale snapshot fails the write instead of corrupting it
//! - **Testability**: in-memory implementation for tests, SQL for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use corso_core::{CourseId, OrganizationId, OutboxEntryId};

use crate::course::{Course, CourseMetadata, StageFailure};
use crate::error::Result;
use crate::events::{Actor, FsmEvent};
use crate::idempotency::IdempotencyMarker;
use crate::outbox::{JobSpec, OutboxEntry};
use crate::state::CourseState;

/// Course creation payload for create-if-missing transitions.
#[derive(Debug, Clone)]
pub struct CreateCourse {
    /// Course metadata.
    pub metadata: CourseMetadata,
    /// User creating the course.
    pub created_by: String,
}

/// One transactional state change with its side effects.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// The course to transition.
    pub course_id: CourseId,
    /// Owning organization (used when creating; verified otherwise).
    pub organization_id: OrganizationId,
    /// The target state.
    pub target_state: CourseState,
    /// Who initiated the transition.
    pub actor: Actor,
    /// Outbox entries to insert in the same transaction.
    pub jobs: Vec<JobSpec>,
    /// Create the course first if it does not exist.
    pub create: Option<CreateCourse>,
    /// Optimistic-concurrency guard: fail unless the stored state matches.
    pub expected_state: Option<CourseState>,
    /// Consume this outbox entry in the same transaction.
    pub mark_processed: Option<OutboxEntryId>,
    /// Failure to retain when the target state is `failed`.
    pub failure: Option<StageFailure>,
}

impl TransitionRequest {
    /// Creates a bare transition request.
    #[must_use]
    pub fn new(
        course_id: CourseId,
        organization_id: OrganizationId,
        target_state: CourseState,
        actor: Actor,
    ) -> Self {
        Self {
            course_id,
            organization_id,
            target_state,
            actor,
            jobs: Vec::new(),
            create: None,
            expected_state: None,
            mark_processed: None,
            failure: None,
        }
    }

    /// Adds outbox entries to insert with the transition.
    #[must_use]
    pub fn with_jobs(mut self, jobs: impl Into<Vec<JobSpec>>) -> Self {
        self.jobs = jobs.into();
        self
    }

    /// Creates the course first if it does not exist.
    #[must_use]
    pub fn creating(mut self, create: CreateCourse) -> Self {
        self.create = Some(create);
        self
    }

    /// Guards the transition on the currently stored state.
    #[must_use]
    pub const fn expecting(mut self, state: CourseState) -> Self {
        self.expected_state = Some(state);
        self
    }

    /// Consumes an outbox entry in the same transaction.
    #[must_use]
    pub const fn consuming(mut self, entry_id: OutboxEntryId) -> Self {
        self.mark_processed = Some(entry_id);
        self
    }

    /// Retains a failure record with the transition.
    #[must_use]
    pub fn with_failure(mut self, failure: StageFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Result of an applied transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// The course after the transition.
    pub course: Course,
    /// The outbox entries created by the transition.
    pub entries: Vec<OutboxEntry>,
    /// False when the request was a self-transition no-op (no version
    /// bump, no audit event).
    pub applied: bool,
}

/// Result of attempting to claim an idempotency marker.
#[derive(Debug, Clone)]
pub enum IdempotencyClaim {
    /// The caller now holds the marker and must finalize or delete it.
    Claimed,
    /// A committed marker exists; replay its cached response.
    Committed(IdempotencyMarker),
    /// Another request holds a fresh in-progress marker; wait and re-read.
    InProgress,
}

/// Storage abstraction for orchestration state.
///
/// ## Transaction Boundary
///
/// [`Store::transition_and_enqueue`] is the single transactional primitive:
/// the initialize operation, every worker stage completion, cancellation,
/// and restart all go through it. Implementations must apply it atomically
/// and validate the state transition against the stored state immediately
/// before commit.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// worker tasks.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Course Operations ---

    /// Gets a course by ID.
    ///
    /// Returns `None` if the course does not exist.
    async fn get_course(&self, course_id: &CourseId) -> Result<Option<Course>>;

    /// Applies one state transition and its side effects atomically.
    ///
    /// In one transaction:
    /// 1. create the course if requested and missing
    /// 2. validate and apply the state transition (optionally guarded by
    ///    `expected_state`)
    /// 3. consume the triggering outbox entry, if any
    /// 4. insert the new outbox entries
    /// 5. append one audit event (skipped for self-transition no-ops)
    ///
    /// # Errors
    ///
    /// [`crate::error::Error::CourseNotFound`] if the course does not exist
    /// and creation was not requested; [`crate::error::Error::InvalidTransition`]
    /// if the transition is not legal from the stored state. Nothing is
    /// partially committed on error.
    async fn transition_and_enqueue(&self, request: TransitionRequest)
        -> Result<TransitionOutcome>;

    // --- Outbox Operations ---

    /// Claims the next claimable entry for a queue.
    ///
    /// At most one consumer holds a claim on an entry at a time; claims
    /// expire after the store's lease so crashed workers don't strand
    /// entries.
    async fn claim_next(
        &self,
        queue_name: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>>;

    /// Marks an entry processed outside a transition (abort paths).
    ///
    /// Already-processed entries are a no-op, so consumption is idempotent.
    async fn mark_processed(&self, entry_id: &OutboxEntryId, now: DateTime<Utc>) -> Result<()>;

    /// Returns the unprocessed entries for a course, oldest first.
    async fn pending_entries(&self, course_id: &CourseId) -> Result<Vec<OutboxEntry>>;

    /// Returns the number of unprocessed entries in a queue.
    async fn outbox_depth(&self, queue_name: &str) -> Result<usize>;

    // --- Idempotency Operations ---

    /// Attempts to install `marker` under its key hash.
    ///
    /// The uniqueness of the marker is the mutual-exclusion mechanism for
    /// duplicate requests: exactly one concurrent caller gets
    /// [`IdempotencyClaim::Claimed`]. Expired committed markers and stale
    /// in-progress markers (older than `stale_takeover`) are replaced.
    async fn claim_idempotency(
        &self,
        marker: IdempotencyMarker,
        stale_takeover: Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyClaim>;

    /// Finalizes a held marker with its cached response.
    async fn commit_idempotency(&self, key_hash: &str, response: Value, ttl: Duration)
        -> Result<()>;

    /// Deletes a held marker (the computation failed; never cache failures).
    async fn delete_idempotency(&self, key_hash: &str) -> Result<()>;

    /// Purges expired markers, returning how many were removed.
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<usize>;

    // --- Audit Operations ---

    /// Returns the audit log for a course in sequence order.
    async fn list_events(&self, course_id: &CourseId) -> Result<Vec<FsmEvent>>;
}

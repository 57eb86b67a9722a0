//! Flow service: the atomic initialize operation and lifecycle commands.
//!
//! [`FlowService::initialize`] is the single entry point the API layer
//! calls to start (or restart) pipeline work for a course. It wraps the
//! store's transactional transition-and-enqueue primitive in the
//! idempotency protocol, so repeated identical requests produce exactly one
//! set of side effects and byte-identical responses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chrono::{DateTime, Utc};
use corso_core::{CourseId, OrganizationId, OutboxEntryId};

use crate::course::{Course, CourseMetadata};
use crate::error::{Error, Result};
use crate::events::{Actor, FsmEvent};
use crate::idempotency::{self, IdempotencyMarker, Resolved, ResolveOptions};
use crate::outbox::{JobOptions, JobSpec, OutboxEntry};
use crate::state::CourseState;
use crate::store::{CreateCourse, Store, TransitionRequest};

/// Idempotency scope for the initialize operation.
pub const INITIALIZE_SCOPE: &str = "course.initialize";

/// The initialize request, as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeCommand {
    /// The course to initialize (created if missing).
    pub course_id: CourseId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// User on whose behalf the request runs.
    pub user_id: String,
    /// Caller-supplied idempotency key.
    pub idempotency_key: String,
    /// Who initiated the request.
    pub initiated_by: Actor,
    /// The state to move the course into.
    pub initial_state: CourseState,
    /// Jobs to enqueue with the transition.
    pub jobs: Vec<JobSpec>,
    /// Course metadata (used when the course is created).
    pub metadata: CourseMetadata,
}

/// Snapshot of the course state after initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSnapshot {
    /// The course ID.
    pub course_id: CourseId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// State after the transition.
    pub state: CourseState,
    /// Version after the transition.
    pub version: u64,
    /// User who created the course.
    pub created_by: String,
    /// When the course was created.
    pub created_at: DateTime<Utc>,
}

impl From<&Course> for CourseSnapshot {
    fn from(course: &Course) -> Self {
        Self {
            course_id: course.id,
            organization_id: course.organization_id.clone(),
            state: course.state,
            version: course.version,
            created_by: course.created_by.clone(),
            created_at: course.created_at,
        }
    }
}

/// Descriptor of an outbox entry created by initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntryDescriptor {
    /// The entry ID.
    pub outbox_id: OutboxEntryId,
    /// The queue that will consume it.
    pub queue_name: String,
    /// The opaque job payload.
    pub job_data: serde_json::Value,
    /// Consumption options.
    pub job_options: JobOptions,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl From<&OutboxEntry> for OutboxEntryDescriptor {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            outbox_id: entry.id,
            queue_name: entry.queue_name.clone(),
            job_data: entry.job_data.clone(),
            job_options: entry.options,
            created_at: entry.created_at,
        }
    }
}

/// The initialize response, cached verbatim for idempotent replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Course state after the transition.
    pub state: CourseSnapshot,
    /// Outbox entries created by the transition.
    pub outbox_entries: Vec<OutboxEntryDescriptor>,
}

/// Lifecycle operations over the orchestration store.
pub struct FlowService<S> {
    store: Arc<S>,
    resolve_options: ResolveOptions,
    metrics: crate::metrics::FlowMetrics,
}

impl<S: Store> FlowService<S> {
    /// Creates a service over the given store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            resolve_options: ResolveOptions::default(),
            metrics: crate::metrics::FlowMetrics::new(),
        }
    }

    /// Overrides the idempotency tunables.
    #[must_use]
    pub fn with_resolve_options(mut self, options: ResolveOptions) -> Self {
        self.resolve_options = options;
        self
    }

    /// Atomically initializes pipeline work for a course.
    ///
    /// In one transaction: validates and writes the course state (creating
    /// the course if needed), inserts one outbox entry per job, and appends
    /// one audit event. The whole operation is deduplicated by
    /// `idempotency_key`: concurrent or repeated identical requests observe
    /// the first writer's cached response.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] / [`Error::CourseNotFound`] from the
    /// transactional write (nothing partially committed);
    /// [`Error::IdempotencyKeyReuse`] when the key is reused with a
    /// different payload.
    #[tracing::instrument(
        skip(self, command),
        fields(course_id = %command.course_id, organization = %command.organization_id)
    )]
    pub async fn initialize(
        &self,
        command: InitializeCommand,
    ) -> Result<Resolved<InitializeResponse>> {
        let payload = serde_json::to_value(&command)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let request_hash = IdempotencyMarker::hash_request(&payload);
        let key = command.idempotency_key.clone();

        let store = Arc::clone(&self.store);
        let resolved = idempotency::resolve(
            &*self.store,
            &key,
            INITIALIZE_SCOPE,
            &request_hash,
            &self.resolve_options,
            move || async move {
                let outcome = store
                    .transition_and_enqueue(
                        TransitionRequest::new(
                            command.course_id,
                            command.organization_id.clone(),
                            command.initial_state,
                            command.initiated_by,
                        )
                        .creating(CreateCourse {
                            metadata: command.metadata.clone(),
                            created_by: command.user_id.clone(),
                        })
                        .with_jobs(command.jobs.clone()),
                    )
                    .await?;
                Ok(InitializeResponse {
                    state: CourseSnapshot::from(&outcome.course),
                    outbox_entries: outcome
                        .entries
                        .iter()
                        .map(OutboxEntryDescriptor::from)
                        .collect(),
                })
            },
        )
        .await?;

        if resolved.replayed {
            self.metrics.record_idempotency_replay();
        }
        Ok(resolved)
    }

    /// Cancels a course.
    ///
    /// Valid from any non-terminal state; in-flight workers observe the
    /// `cancelled` state and abort. Cancelling an already-cancelled course
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::CourseNotFound`] for unknown courses;
    /// [`Error::InvalidTransition`] from `completed`/`failed`.
    #[tracing::instrument(skip(self), fields(course_id = %course_id))]
    pub async fn cancel(&self, course_id: CourseId, actor: Actor) -> Result<Course> {
        let course = self.require_course(&course_id).await?;
        let outcome = self
            .store
            .transition_and_enqueue(TransitionRequest::new(
                course_id,
                course.organization_id,
                CourseState::Cancelled,
                actor,
            ))
            .await?;
        Ok(outcome.course)
    }

    /// Restarts a terminal course back to `pending`.
    ///
    /// The retained failure is cleared; callers then issue a fresh
    /// [`FlowService::initialize`] (with a new idempotency key) to enqueue
    /// pipeline work again.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] when the course is not terminal.
    #[tracing::instrument(skip(self), fields(course_id = %course_id))]
    pub async fn restart(&self, course_id: CourseId, actor: Actor) -> Result<Course> {
        let course = self.require_course(&course_id).await?;
        if !course.is_terminal() {
            return Err(Error::InvalidTransition {
                from: course.state,
                to: CourseState::Pending,
                reason: "only terminal courses can be restarted".into(),
            });
        }
        let outcome = self
            .store
            .transition_and_enqueue(TransitionRequest::new(
                course_id,
                course.organization_id,
                CourseState::Pending,
                actor,
            ))
            .await?;
        Ok(outcome.course)
    }

    /// Returns a course's audit log in sequence order.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn audit_log(&self, course_id: CourseId) -> Result<Vec<FsmEvent>> {
        self.store.list_events(&course_id).await
    }

    async fn require_course(&self, course_id: &CourseId) -> Result<Course> {
        self.store
            .get_course(course_id)
            .await?
            .ok_or(Error::CourseNotFound {
                course_id: *course_id,
            })
    }
}

//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a thread-safe in-memory
//! implementation of the [`Store`] trait.
//!
//! ## Transaction model
//!
//! All state lives behind one `RwLock`; a write guard *is* the transaction
//! boundary. Every mutation in [`Store::transition_and_enqueue`] is staged
//! against clones and validated first, then committed in one assignment
//! block, so an error at any validation step leaves nothing applied.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, single process only
//! - **No persistence**: all state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use corso_core::{CourseId, OutboxEntryId};

use super::{IdempotencyClaim, Store, TransitionOutcome, TransitionRequest};
use crate::course::{Course, StageFailure};
use crate::error::{Error, Result};
use crate::events::FsmEvent;
use crate::idempotency::{IdempotencyMarker, MarkerStatus};
use crate::outbox::OutboxEntry;
use crate::state::CourseState;

/// Default claim lease before an entry becomes claimable again.
const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

#[derive(Debug, Default)]
struct Inner {
    courses: HashMap<CourseId, Course>,
    outbox: Vec<OutboxEntry>,
    events: Vec<FsmEvent>,
    markers: HashMap<String, IdempotencyMarker>,
}

/// In-memory store for testing.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    claim_lease: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates a new in-memory store with the default claim lease.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    /// Creates a store with a custom claim lease.
    ///
    /// Use this to test lease expiry with short timeouts.
    #[must_use]
    pub fn with_claim_lease(claim_lease: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            claim_lease,
        }
    }

    /// Returns the number of courses currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn course_count(&self) -> Result<usize> {
        let count = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.courses.len()
        };
        Ok(count)
    }

    /// Returns every outbox entry ever created, for test assertions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all_entries(&self) -> Result<Vec<OutboxEntry>> {
        let entries = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.outbox.clone()
        };
        Ok(entries)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_course(&self, course_id: &CourseId) -> Result<Option<Course>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.courses.get(course_id).cloned()
        };
        Ok(result)
    }

    #[tracing::instrument(
        skip(self, request),
        fields(course_id = %request.course_id, target = %request.target_state, actor = %request.actor)
    )]
    async fn transition_and_enqueue(
        &self,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        // Stage 1: resolve (or create) the course on a clone.
        let mut course = match inner.courses.get(&request.course_id) {
            Some(existing) => {
                if existing.organization_id != request.organization_id {
                    return Err(Error::storage(format!(
                        "course {} belongs to another organization",
                        request.course_id
                    )));
                }
                existing.clone()
            }
            None => match &request.create {
                Some(create) => Course::new(
                    request.course_id,
                    request.organization_id.clone(),
                    create.metadata.clone(),
                    create.created_by.clone(),
                ),
                None => {
                    return Err(Error::CourseNotFound {
                        course_id: request.course_id,
                    });
                }
            },
        };

        // Stage 2: optimistic-concurrency guard against the stored state.
        if let Some(expected) = request.expected_state {
            if course.state != expected {
                return Err(Error::InvalidTransition {
                    from: course.state,
                    to: request.target_state,
                    reason: format!(
                        "course state changed concurrently (expected {expected})"
                    ),
                });
            }
        }

        // Stage 3: validate and apply the transition on the clone.
        let old_state = course.state;
        let applied = course.transition_to(request.target_state)?;
        if request.target_state == CourseState::Failed {
            let failure = request
                .failure
                .clone()
                .unwrap_or_else(|| StageFailure::new(old_state.stage(), "stage failed"));
            course.record_failure(failure);
        }

        // Stage 4: stage consumption of the triggering entry.
        let processed_index = match request.mark_processed {
            Some(entry_id) => {
                let index = inner
                    .outbox
                    .iter()
                    .position(|e| e.id == entry_id)
                    .ok_or_else(|| {
                        Error::storage(format!("outbox entry {entry_id} not found"))
                    })?;
                if inner.outbox[index].is_processed() {
                    return Err(Error::storage(format!(
                        "outbox entry {entry_id} was already processed"
                    )));
                }
                Some(index)
            }
            None => None,
        };

        // Stage 5: stage the new entries, enforcing at most one unprocessed
        // entry per (course, queue).
        let mut entries = Vec::with_capacity(request.jobs.len());
        for job in &request.jobs {
            let duplicate = inner.outbox.iter().enumerate().any(|(i, e)| {
                e.course_id == request.course_id
                    && e.queue_name == job.queue_name
                    && !e.is_processed()
                    && processed_index != Some(i)
            });
            if duplicate {
                return Err(Error::storage(format!(
                    "unprocessed outbox entry already exists for course {} on queue {}",
                    request.course_id, job.queue_name
                )));
            }
            entries.push(OutboxEntry::from_spec(request.course_id, job));
        }

        // Stage 6: commit everything.
        let now = Utc::now();
        if let Some(index) = processed_index {
            inner.outbox[index].processed_at = Some(now);
        }
        if applied {
            let sequence = inner
                .events
                .iter()
                .filter(|e| e.course_id == request.course_id)
                .count() as u64
                + 1;
            inner.events.push(FsmEvent::state_changed(
                course.organization_id.clone(),
                course.id,
                old_state,
                course.state,
                request.actor,
                sequence,
            ));
        }
        inner.outbox.extend(entries.iter().cloned());
        inner.courses.insert(course.id, course.clone());

        Ok(TransitionOutcome {
            course,
            entries,
            applied,
        })
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let lease = self.claim_lease;

        let mut best: Option<usize> = None;
        for (i, entry) in inner.outbox.iter().enumerate() {
            if entry.queue_name != queue_name || !entry.is_claimable(now, lease) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = &inner.outbox[j];
                    if (entry.options.priority, entry.id) < (current.options.priority, current.id)
                    {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }

        let Some(index) = best else {
            return Ok(None);
        };
        let entry = &mut inner.outbox[index];
        entry.claimed_by = Some(claimant.to_string());
        entry.claimed_at = Some(now);
        Ok(Some(entry.clone()))
    }

    async fn mark_processed(&self, entry_id: &OutboxEntryId, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let entry = inner
            .outbox
            .iter_mut()
            .find(|e| e.id == *entry_id)
            .ok_or_else(|| Error::storage(format!("outbox entry {entry_id} not found")))?;
        if entry.processed_at.is_none() {
            entry.processed_at = Some(now);
        }
        Ok(())
    }

    async fn pending_entries(&self, course_id: &CourseId) -> Result<Vec<OutboxEntry>> {
        let entries = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .outbox
                .iter()
                .filter(|e| e.course_id == *course_id && !e.is_processed())
                .cloned()
                .collect()
        };
        Ok(entries)
    }

    async fn outbox_depth(&self, queue_name: &str) -> Result<usize> {
        let depth = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .outbox
                .iter()
                .filter(|e| e.queue_name == queue_name && !e.is_processed())
                .count()
        };
        Ok(depth)
    }

    async fn claim_idempotency(
        &self,
        marker: IdempotencyMarker,
        stale_takeover: Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyClaim> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        match inner.markers.get(&marker.key_hash) {
            None => {
                inner.markers.insert(marker.key_hash.clone(), marker);
                Ok(IdempotencyClaim::Claimed)
            }
            Some(existing) => match existing.status {
                MarkerStatus::Committed if !existing.is_expired(now) => {
                    Ok(IdempotencyClaim::Committed(existing.clone()))
                }
                MarkerStatus::InProgress if !existing.is_stale(stale_takeover, now) => {
                    Ok(IdempotencyClaim::InProgress)
                }
                // Expired or stale: replace and take over.
                _ => {
                    inner.markers.insert(marker.key_hash.clone(), marker);
                    Ok(IdempotencyClaim::Claimed)
                }
            },
        }
    }

    async fn commit_idempotency(
        &self,
        key_hash: &str,
        response: Value,
        ttl: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let marker = inner
            .markers
            .remove(key_hash)
            .ok_or_else(|| Error::storage(format!("idempotency marker {key_hash} not found")))?;
        inner
            .markers
            .insert(key_hash.to_string(), marker.finalize_committed(response, ttl));
        Ok(())
    }

    async fn delete_idempotency(&self, key_hash: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.markers.remove(key_hash);
        Ok(())
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let before = inner.markers.len();
        inner.markers.retain(|_, m| !m.is_expired(now));
        Ok(before - inner.markers.len())
    }

    async fn list_events(&self, course_id: &CourseId) -> Result<Vec<FsmEvent>> {
        let mut events: Vec<FsmEvent> = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .events
                .iter()
                .filter(|e| e.course_id == *course_id)
                .cloned()
                .collect()
        };
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::CourseMetadata;
    use crate::events::Actor;
    use crate::outbox::JobSpec;
    use crate::store::CreateCourse;
    use corso_core::OrganizationId;
    use serde_json::json;

    fn org() -> OrganizationId {
        OrganizationId::new_unchecked("acme-academy")
    }

    fn create() -> CreateCourse {
        CreateCourse {
            metadata: CourseMetadata::new("Intro to Soil Science", "en"),
            created_by: "user@example.com".into(),
        }
    }

    fn initialize_request(course_id: CourseId) -> TransitionRequest {
        TransitionRequest::new(course_id, org(), CourseState::OutlineInit, Actor::Api)
            .creating(create())
            .with_jobs(vec![JobSpec::new(
                "course.outline",
                json!({"prompt": "outline"}),
            )])
    }

    #[tokio::test]
    async fn transition_creates_course_entry_and_event_together() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();

        let outcome = store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.course.state, CourseState::OutlineInit);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(store.outbox_depth("course.outline").await.unwrap(), 1);

        let events = store.list_events(&course_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_state, CourseState::Pending);
        assert_eq!(events[0].new_state, CourseState::OutlineInit);
    }

    #[tokio::test]
    async fn missing_course_without_create_fails() {
        let store = InMemoryStore::new();
        let request = TransitionRequest::new(
            CourseId::generate(),
            org(),
            CourseState::OutlineInit,
            Actor::Api,
        );
        let err = store.transition_and_enqueue(request).await.unwrap_err();
        assert!(matches!(err, Error::CourseNotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_transition_commits_nothing() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        // Backward: outline_init -> pending is not legal.
        let bad = TransitionRequest::new(course_id, org(), CourseState::Pending, Actor::Worker)
            .with_jobs(vec![JobSpec::new("course.sections", json!({}))]);
        let err = store.transition_and_enqueue(bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let course = store.get_course(&course_id).await.unwrap().unwrap();
        assert_eq!(course.state, CourseState::OutlineInit);
        assert_eq!(store.outbox_depth("course.sections").await.unwrap(), 0);
        assert_eq!(store.list_events(&course_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_step_rolls_back_state_write() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        // Consuming a nonexistent entry fails after the state validation
        // step; the state change must not be observable either.
        let request = TransitionRequest::new(
            course_id,
            org(),
            CourseState::OutlineProcessing,
            Actor::Worker,
        )
        .consuming(OutboxEntryId::generate());
        assert!(store.transition_and_enqueue(request).await.is_err());

        let course = store.get_course(&course_id).await.unwrap().unwrap();
        assert_eq!(course.state, CourseState::OutlineInit);
        assert_eq!(course.version, 2);
        assert_eq!(store.list_events(&course_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_expected_state_is_rejected() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        let stale = TransitionRequest::new(
            course_id,
            org(),
            CourseState::OutlineProcessing,
            Actor::Worker,
        )
        .expecting(CourseState::Pending);
        let err = store.transition_and_enqueue(stale).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn self_transition_is_noop_without_event() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        let noop =
            TransitionRequest::new(course_id, org(), CourseState::OutlineInit, Actor::Api);
        let outcome = store.transition_and_enqueue(noop).await.unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.course.version, 2);
        assert_eq!(store.list_events(&course_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_unprocessed_queue_entry_is_rejected() {
        let store = InMemoryStore::new();
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        // Re-enqueueing on the same queue while an entry is pending
        // violates the one-unprocessed-entry-per-queue invariant.
        let duplicate = TransitionRequest::new(
            course_id,
            org(),
            CourseState::OutlineInit,
            Actor::Api,
        )
        .with_jobs(vec![JobSpec::new("course.outline", json!({}))]);
        assert!(store.transition_and_enqueue(duplicate).await.is_err());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let store = InMemoryStore::with_claim_lease(Duration::seconds(60));
        let course_id = CourseId::generate();
        store
            .transition_and_enqueue(initialize_request(course_id))
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim_next("course.outline", "w1", now).await.unwrap();
        assert!(first.is_some());

        // Second claimant sees nothing while the lease is held.
        let second = store.claim_next("course.outline", "w2", now).await.unwrap();
        assert!(second.is_none());

        // After lease expiry the entry is claimable again.
        let later = now + Duration::seconds(120);
        let third = store.claim_next("course.outline", "w3", later).await.unwrap();
        assert!(third.is_some());
        assert_eq!(third.unwrap().claimed_by.as_deref(), Some("w3"));
    }

    #[tokio::test]
    async fn claim_honors_priority() {
        let store = InMemoryStore::new();
        let course_a = CourseId::generate();
        let course_b = CourseId::generate();
        store
            .transition_and_enqueue(
                TransitionRequest::new(course_a, org(), CourseState::OutlineInit, Actor::Api)
                    .creating(create())
                    .with_jobs(vec![JobSpec::new("course.outline", json!({"c": "a"}))]),
            )
            .await
            .unwrap();
        store
            .transition_and_enqueue(
                TransitionRequest::new(course_b, org(), CourseState::OutlineInit, Actor::Api)
                    .creating(create())
                    .with_jobs(vec![
                        JobSpec::new("course.outline", json!({"c": "b"}))
                            .with_options(crate::outbox::JobOptions::new().with_priority(-1)),
                    ]),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_next("course.outline", "w1", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.course_id, course_b);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_markers() {
        let store = InMemoryStore::new();
        let fresh = IdempotencyMarker::new_in_progress("k1", "s", "h", Duration::hours(1));
        let mut old = IdempotencyMarker::new_in_progress("k2", "s", "h", Duration::hours(1));
        old.expires_at = Utc::now() - Duration::seconds(1);

        store
            .claim_idempotency(fresh, Duration::minutes(10), Utc::now())
            .await
            .unwrap();
        store
            .claim_idempotency(old, Duration::minutes(10), Utc::now())
            .await
            .unwrap();

        let purged = store.purge_expired_idempotency(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
    }
}

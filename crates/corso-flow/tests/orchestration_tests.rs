//! Integration tests for the orchestration core: idempotent initialize,
//! transactional atomicity, transition legality, and cancellation.

use std::sync::Arc;

use serde_json::json;

use corso_core::{CourseId, OrganizationId};
use corso_flow::course::CourseMetadata;
use corso_flow::error::Error;
use corso_flow::events::Actor;
use corso_flow::outbox::JobSpec;
use corso_flow::service::{FlowService, InitializeCommand};
use corso_flow::state::{CourseState, PipelineStage};
use corso_flow::store::memory::InMemoryStore;
use corso_flow::store::{Store, TransitionRequest};

fn command(key: &str, course_id: CourseId) -> InitializeCommand {
    let stage = PipelineStage::first();
    InitializeCommand {
        course_id,
        organization_id: OrganizationId::new_unchecked("acme-academy"),
        user_id: "user@example.com".into(),
        idempotency_key: key.into(),
        initiated_by: Actor::Api,
        initial_state: stage.init_state(),
        jobs: vec![JobSpec::new(
            stage.queue_name(),
            json!({"prompt": "Generate a course outline."}),
        )],
        metadata: CourseMetadata::new("Intro to Soil Science", "en"),
    }
}

#[tokio::test]
async fn double_initialize_is_byte_identical_with_one_side_effect_set() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();

    let first = service.initialize(command("k1", course_id)).await.unwrap();
    let second = service.initialize(command("k1", course_id)).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);

    let first_json = serde_json::to_string(&first.value).unwrap();
    let second_json = serde_json::to_string(&second.value).unwrap();
    assert_eq!(first_json, second_json);

    assert_eq!(store.course_count().unwrap(), 1);
    assert_eq!(store.all_entries().unwrap().len(), 1);
    assert_eq!(store.list_events(&course_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_initialize_with_same_key_executes_once() {
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(FlowService::new(store.clone()));
    let course_id = CourseId::generate();

    let a = {
        let service = Arc::clone(&service);
        let cmd = command("k1", course_id);
        tokio::spawn(async move { service.initialize(cmd).await })
    };
    let b = {
        let service = Arc::clone(&service);
        let cmd = command("k1", course_id);
        tokio::spawn(async move { service.initialize(cmd).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    // Exactly one execution; the other call observed its result.
    assert!(a.replayed != b.replayed);
    assert_eq!(
        serde_json::to_string(&a.value).unwrap(),
        serde_json::to_string(&b.value).unwrap()
    );
    assert_eq!(store.course_count().unwrap(), 1);
    assert_eq!(store.all_entries().unwrap().len(), 1);
}

#[tokio::test]
async fn interrupted_initialize_leaves_no_partial_writes() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();

    // The transition validates only after the jobs are staged; an invalid
    // initial state must roll back the entity write and the outbox insert
    // together.
    let mut interrupted = command("k1", course_id);
    interrupted.initial_state = CourseState::SectionsInit;
    assert!(service.initialize(interrupted).await.is_err());

    assert_eq!(store.course_count().unwrap(), 0);
    assert!(store.all_entries().unwrap().is_empty());
    assert!(store.list_events(&course_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn backward_transition_is_rejected_and_state_unchanged() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();
    service.initialize(command("k1", course_id)).await.unwrap();

    let org = OrganizationId::new_unchecked("acme-academy");
    // Walk the course to sections_complete.
    for target in [
        CourseState::OutlineProcessing,
        CourseState::OutlineComplete,
        CourseState::SectionsInit,
        CourseState::SectionsProcessing,
        CourseState::SectionsComplete,
    ] {
        store
            .transition_and_enqueue(TransitionRequest::new(
                course_id,
                org.clone(),
                target,
                Actor::Worker,
            ))
            .await
            .unwrap();
    }

    let err = store
        .transition_and_enqueue(TransitionRequest::new(
            course_id,
            org,
            CourseState::SectionsInit,
            Actor::Worker,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidTransition { .. }));
    let course = store.get_course(&course_id).await.unwrap().unwrap();
    assert_eq!(course.state, CourseState::SectionsComplete);
}

#[tokio::test]
async fn stale_worker_cannot_overwrite_cancellation() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();
    service.initialize(command("k1", course_id)).await.unwrap();

    let org = OrganizationId::new_unchecked("acme-academy");
    store
        .transition_and_enqueue(TransitionRequest::new(
            course_id,
            org.clone(),
            CourseState::OutlineProcessing,
            Actor::Worker,
        ))
        .await
        .unwrap();

    // Cancellation lands while the stage is in flight.
    service.cancel(course_id, Actor::Api).await.unwrap();

    // The stale worker finishes and tries to record completion.
    let err = store
        .transition_and_enqueue(TransitionRequest::new(
            course_id,
            org,
            CourseState::OutlineComplete,
            Actor::Worker,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidTransition { .. }));
    let course = store.get_course(&course_id).await.unwrap().unwrap();
    assert_eq!(course.state, CourseState::Cancelled);
}

#[tokio::test]
async fn restart_from_failed_clears_error_and_allows_reinitialize() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();
    service.initialize(command("k1", course_id)).await.unwrap();

    let org = OrganizationId::new_unchecked("acme-academy");
    store
        .transition_and_enqueue(
            TransitionRequest::new(course_id, org, CourseState::Failed, Actor::Worker)
                .with_failure(corso_flow::course::StageFailure::new(
                    Some(PipelineStage::Outline),
                    "llm unreachable",
                )),
        )
        .await
        .unwrap();

    // Consume the stranded outline entry so re-initialization can enqueue.
    let entries = store.all_entries().unwrap();
    store
        .mark_processed(&entries[0].id, chrono::Utc::now())
        .await
        .unwrap();

    let restarted = service.restart(course_id, Actor::Api).await.unwrap();
    assert_eq!(restarted.state, CourseState::Pending);
    assert!(restarted.last_error.is_none());

    // A fresh key re-runs the pipeline from the top.
    let resumed = service.initialize(command("k2", course_id)).await.unwrap();
    assert_eq!(resumed.value.state.state, CourseState::OutlineInit);
}

#[tokio::test]
async fn audit_log_records_every_transition_in_order() {
    let store = Arc::new(InMemoryStore::new());
    let service = FlowService::new(store.clone());
    let course_id = CourseId::generate();
    service.initialize(command("k1", course_id)).await.unwrap();
    service.cancel(course_id, Actor::Api).await.unwrap();

    let events = service.audit_log(course_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].sequence, 1);
    assert_eq!(events[1].sequence, 2);
    assert_eq!(events[0].new_state, events[1].old_state);
    assert_eq!(events[1].new_state, CourseState::Cancelled);
    assert_eq!(events[1].actor, Actor::Api);
}

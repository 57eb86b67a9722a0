//! # corso-flow
//!
//! Job orchestration core for the Corso course-generation pipeline.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Durable Sequencing**: a transactional-outbox-backed state machine
//!   advances each course through the fixed pipeline stages exactly once,
//!   surviving crash and retry
//! - **Idempotent Initialization**: repeated identical requests produce one
//!   set of side effects and byte-identical responses
//! - **Output Repair**: a five-layer cascade recovers valid structured
//!   results from malformed LLM output instead of discarding the run
//! - **Quality Gating**: embedding-similarity acceptance of generated
//!   content against its requirements
//!
//! ## Core Concepts
//!
//! - **Course**: the entity progressing through the pipeline; its state row
//!   is the single source of truth for pipeline progress
//! - **Outbox Entry**: a durable job record written in the same transaction
//!   as the state change that spawned it
//! - **Stage**: one step of the fixed pipeline (`outline`, `sections`,
//!   `assessments`), each with `_init`/`_processing`/`_complete` states
//!
//! ## Guarantees
//!
//! - **Atomic**: state write, outbox insert, and audit event commit
//!   together or not at all
//! - **Ordered**: within one course, stage N+1's job only exists after
//!   stage N's completion is durably committed
//! - **Auditable**: every transition appends an immutable FSM event
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use corso_core::{CourseId, OrganizationId};
//! use corso_flow::course::CourseMetadata;
//! use corso_flow::error::Result;
//! use corso_flow::events::Actor;
//! use corso_flow::handlers::StageJob;
//! use corso_flow::llm::TaskCriticality;
//! use corso_flow::outbox::JobSpec;
//! use corso_flow::quality::CourseRequirements;
//! use corso_flow::service::{FlowService, InitializeCommand};
//! use corso_flow::state::PipelineStage;
//! use corso_flow::store::memory::InMemoryStore;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let service = FlowService::new(store);
//!
//! let stage = PipelineStage::first();
//! let job = StageJob {
//!     prompt: "Generate a course outline for soil science.".into(),
//!     system: None,
//!     requirements: CourseRequirements {
//!         summary: "Soil science fundamentals".into(),
//!         section_requirements: vec!["Soil composition".into()],
//!         language: "en".into(),
//!     },
//!     criticality: TaskCriticality::Standard,
//! };
//!
//! let response = service
//!     .initialize(InitializeCommand {
//!         course_id: CourseId::generate(),
//!         organization_id: OrganizationId::new("acme-academy")?,
//!         user_id: "user@example.com".into(),
//!         idempotency_key: "req-01".into(),
//!         initiated_by: Actor::Api,
//!         initial_state: stage.init_state(),
//!         jobs: vec![JobSpec::new(stage.queue_name(), job.to_value()?)],
//!         metadata: CourseMetadata::new("Intro to Soil Science", "en"),
//!     })
//!     .await?;
//! assert_eq!(response.value.outbox_entries.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod course;
pub mod error;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod llm;
pub mod metrics;
pub mod outbox;
pub mod pipeline;
pub mod quality;
pub mod repair;
pub mod schema;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::course::{Course, CourseMetadata, StageFailure};
    pub use crate::error::{Error, Result};
    pub use crate::events::{Actor, FsmEvent};
    pub use crate::handlers::{LlmStageHandler, QualityPolicy, StageJob};
    pub use crate::idempotency::{IdempotencyMarker, Resolved, ResolveOptions};
    pub use crate::llm::{
        CompletionRequest, CompletionResponse, CompletionService, EmbeddingService, ModelHandle,
        ModelRouter, TaskCriticality,
    };
    pub use crate::metrics::FlowMetrics;
    pub use crate::outbox::{JobOptions, JobSpec, OutboxEntry};
    pub use crate::pipeline::{HandlerRegistry, StageContext, StageHandler, StageOutput};
    pub use crate::quality::{
        CourseRequirements, GeneratedCourse, QualityConfig, QualityGate, QualityReport,
        QualityVerdict,
    };
    pub use crate::repair::{
        RepairAttempt, RepairCascade, RepairConfig, RepairContext, RepairLayer, RepairOutcome,
    };
    pub use crate::schema::{FieldKind, OutputSchema};
    pub use crate::service::{FlowService, InitializeCommand, InitializeResponse};
    pub use crate::state::{CourseState, PipelineStage};
    pub use crate::store::{Store, TransitionOutcome, TransitionRequest};
    pub use crate::worker::{TickOutcome, Worker, WorkerConfig};
}

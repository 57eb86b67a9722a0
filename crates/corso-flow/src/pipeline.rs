//! Stage handler seam and registry.
//!
//! A stage handler executes the domain work for one pipeline stage. The
//! worker owns claiming, retries, state transitions, and enqueueing the
//! next stage; the handler owns only "turn this job into an artifact".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::course::Course;
use crate::error::Result;
use crate::outbox::OutboxEntry;
use crate::state::PipelineStage;

/// Context for one stage execution attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The course being processed, as of claim time.
    pub course: Course,
    /// The stage being executed.
    pub stage: PipelineStage,
    /// Attempt number (1-indexed).
    pub attempt: u32,
}

/// Output of a successful stage execution.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// The validated stage artifact.
    pub artifact: Value,
    /// Payload for the next stage's job. When absent, the worker forwards
    /// the current job payload.
    pub next_job_data: Option<Value>,
}

impl StageOutput {
    /// Creates an output with no explicit next-stage payload.
    #[must_use]
    pub const fn new(artifact: Value) -> Self {
        Self {
            artifact,
            next_job_data: None,
        }
    }

    /// Sets the next stage's job payload.
    #[must_use]
    pub fn with_next_job_data(mut self, data: Value) -> Self {
        self.next_job_data = Some(data);
        self
    }
}

/// Executes the domain work for one pipeline stage.
///
/// Implementations parse LLM output exclusively through the repair cascade;
/// raw unguarded parsing reintroduces exactly the failure class this system
/// exists to eliminate.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Executes the stage and returns its artifact.
    ///
    /// Retryable errors ([`crate::error::Error::ServiceUnavailable`]) are
    /// retried by the worker with backoff; all other errors permanently
    /// fail the stage.
    async fn execute(&self, ctx: &StageContext, job: &OutboxEntry) -> Result<StageOutput>;
}

/// Maps queue names to their stage handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a stage's queue.
    #[must_use]
    pub fn with_handler(mut self, stage: PipelineStage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage.queue_name(), handler);
        self
    }

    /// Registers one handler for every stage.
    #[must_use]
    pub fn with_handler_for_all(mut self, handler: Arc<dyn StageHandler>) -> Self {
        for stage in PipelineStage::ALL {
            self.handlers.insert(stage.queue_name(), Arc::clone(&handler));
        }
        self
    }

    /// Resolves the handler for a queue.
    #[must_use]
    pub fn get(&self, queue_name: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(queue_name).cloned()
    }

    /// Returns the queues this registry serves.
    #[must_use]
    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues: Vec<_> = self.handlers.keys().copied().collect();
        queues.sort_unstable();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpHandler;

    #[async_trait]
    impl StageHandler for NoOpHandler {
        async fn execute(&self, _ctx: &StageContext, _job: &OutboxEntry) -> Result<StageOutput> {
            Ok(StageOutput::new(serde_json::json!({})))
        }
    }

    #[test]
    fn registry_resolves_by_queue() {
        let registry = HandlerRegistry::new().with_handler(PipelineStage::Outline, Arc::new(NoOpHandler));
        assert!(registry.get("course.outline").is_some());
        assert!(registry.get("course.sections").is_none());
    }

    #[test]
    fn registry_covers_all_stages() {
        let registry = HandlerRegistry::new().with_handler_for_all(Arc::new(NoOpHandler));
        assert_eq!(
            registry.queues(),
            vec!["course.assessments", "course.outline", "course.sections"]
        );
    }
}

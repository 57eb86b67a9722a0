//! Service seams for LLM completion and embedding backends.
//!
//! This module provides:
//!
//! - [`CompletionService`]: trait for text-generation backends
//! - [`EmbeddingService`]: trait for embedding-vector backends
//! - [`ModelRouter`]: explicit mapping from (stage, criticality) to model
//!
//! ## Design Principles
//!
//! - **Vendor agnostic**: the pipeline never names a concrete provider
//! - **Explicit routing**: which model serves which task is configuration
//!   passed into the cascade and dispatcher, never hard-coded per call site
//! - **Swappable**: test doubles implement the same traits

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::PipelineStage;

/// An opaque handle naming a model at some provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelHandle(String);

impl ModelHandle {
    /// Creates a new model handle.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How much a task's output quality matters for model selection.
///
/// Different tasks have measurably different reliability per model and must
/// be independently tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCriticality {
    /// Routine generation work.
    Standard,
    /// Work that feeds later stages; failures are expensive.
    Elevated,
    /// Last-resort work where cost is secondary to success probability.
    Critical,
}

/// A completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// The model to run.
    pub model: ModelHandle,
    /// Optional system instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// The user prompt.
    pub prompt: String,
}

impl CompletionRequest {
    /// Creates a new completion request.
    #[must_use]
    pub fn new(model: ModelHandle, prompt: impl Into<String>) -> Self {
        Self {
            model,
            system: None,
            prompt: prompt.into(),
        }
    }

    /// Sets the system instruction.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// The raw generated text. May or may not be valid JSON; callers must
    /// route it through the repair cascade before trusting its structure.
    pub text: String,
    /// The model that actually served the request.
    pub model: ModelHandle,
}

/// Text-generation backend.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// worker tasks.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generates a completion for the given request.
    ///
    /// Implementations should map network failures and timeouts to
    /// [`crate::error::Error::ServiceUnavailable`] so the worker can retry
    /// them with backoff.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Embedding-vector backend.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Returns an embedding vector for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Explicit mapping from (stage, criticality) to model identifier.
///
/// The escalation and fallback models back the upper repair-cascade layers:
/// escalation re-runs a failed task on a more capable model; the fallback is
/// a designated high-reliability model reserved for last-resort use.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    default: ModelHandle,
    routes: HashMap<(PipelineStage, TaskCriticality), ModelHandle>,
    escalation: ModelHandle,
    fallback: ModelHandle,
}

impl ModelRouter {
    /// Creates a router where every task runs on `default` and the upper
    /// cascade layers also use `default` until configured otherwise.
    #[must_use]
    pub fn new(default: ModelHandle) -> Self {
        Self {
            escalation: default.clone(),
            fallback: default.clone(),
            default,
            routes: HashMap::new(),
        }
    }

    /// Routes a (stage, criticality) pair to a specific model.
    #[must_use]
    pub fn with_route(
        mut self,
        stage: PipelineStage,
        criticality: TaskCriticality,
        model: ModelHandle,
    ) -> Self {
        self.routes.insert((stage, criticality), model);
        self
    }

    /// Sets the escalation model used by the model-escalation repair layer.
    #[must_use]
    pub fn with_escalation(mut self, model: ModelHandle) -> Self {
        self.escalation = model;
        self
    }

    /// Sets the emergency-fallback model used by the last repair layer.
    #[must_use]
    pub fn with_fallback(mut self, model: ModelHandle) -> Self {
        self.fallback = model;
        self
    }

    /// Resolves the model for a task.
    #[must_use]
    pub fn model_for(&self, stage: PipelineStage, criticality: TaskCriticality) -> &ModelHandle {
        self.routes.get(&(stage, criticality)).unwrap_or(&self.default)
    }

    /// Returns the escalation model.
    #[must_use]
    pub const fn escalation_model(&self) -> &ModelHandle {
        &self.escalation
    }

    /// Returns the emergency-fallback model.
    #[must_use]
    pub const fn fallback_model(&self) -> &ModelHandle {
        &self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_falls_back_to_default() {
        let router = ModelRouter::new(ModelHandle::new("standard-v1"));
        assert_eq!(
            router
                .model_for(PipelineStage::Outline, TaskCriticality::Standard)
                .as_str(),
            "standard-v1"
        );
    }

    #[test]
    fn router_honors_explicit_routes() {
        let router = ModelRouter::new(ModelHandle::new("standard-v1")).with_route(
            PipelineStage::Assessments,
            TaskCriticality::Elevated,
            ModelHandle::new("careful-v2"),
        );
        assert_eq!(
            router
                .model_for(PipelineStage::Assessments, TaskCriticality::Elevated)
                .as_str(),
            "careful-v2"
        );
        assert_eq!(
            router
                .model_for(PipelineStage::Assessments, TaskCriticality::Standard)
                .as_str(),
            "standard-v1"
        );
    }

    #[test]
    fn escalation_and_fallback_default_to_base_model() {
        let router = ModelRouter::new(ModelHandle::new("standard-v1"));
        assert_eq!(router.escalation_model().as_str(), "standard-v1");
        assert_eq!(router.fallback_model().as_str(), "standard-v1");

        let router = router
            .with_escalation(ModelHandle::new("large-v1"))
            .with_fallback(ModelHandle::new("reliable-v1"));
        assert_eq!(router.escalation_model().as_str(), "large-v1");
        assert_eq!(router.fallback_model().as_str(), "reliable-v1");
    }
}

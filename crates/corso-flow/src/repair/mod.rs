//! Resilient output repair cascade.
//!
//! This module provides:
//! - [`RepairCascade`]: five ordered recovery strategies for invalid LLM output
//! - [`RepairConfig`]: which layers a call site enables
//! - [`RepairOutcome`] / [`RepairAttempt`]: what happened, for diagnostics
//!
//! ## Layers
//!
//! 1. **Auto-repair** ([`auto`]): deterministic structural fixes, no model call
//! 2. **Critique-revise**: feed the invalid output and the validation error
//!    back to the same model and re-validate the revision
//! 3. **Partial regeneration**: regenerate only the fields that failed
//!    validation, preserving the valid ones
//! 4. **Model escalation**: re-run the original task on a more capable model
//! 5. **Emergency fallback**: re-run on a designated high-reliability model
//!
//! Layers are attempted top-down; the first valid result short-circuits the
//! rest. Every candidate — from every layer — is validated against the
//! target [`OutputSchema`] before acceptance, so no unvalidated value ever
//! escapes the cascade boundary. Exhausting every enabled layer is an error
//! ([`crate::error::Error::RepairExhausted`]) carrying the full attempt
//! history; callers must fail the stage on it, never skip validation.
//!
//! Transient service failures ([`crate::error::Error::ServiceUnavailable`])
//! abort the cascade and propagate, so the worker's retry/backoff policy
//! governs them instead of being misreported as repair exhaustion.

pub mod auto;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, CompletionService, ModelHandle, ModelRouter, TaskCriticality};
use crate::metrics::FlowMetrics;
use crate::schema::OutputSchema;
use crate::state::PipelineStage;

/// One of the five repair strategies, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairLayer {
    /// Deterministic structural fixes, free of cost.
    AutoRepair,
    /// Ask the same model to correct its own output.
    CritiqueRevise,
    /// Regenerate only the failed fields.
    PartialRegeneration,
    /// Re-run the original task on a more capable model.
    ModelEscalation,
    /// Re-run on the designated last-resort model.
    EmergencyFallback,
}

impl RepairLayer {
    /// All layers in cascade order.
    pub const ALL: [Self; 5] = [
        Self::AutoRepair,
        Self::CritiqueRevise,
        Self::PartialRegeneration,
        Self::ModelEscalation,
        Self::EmergencyFallback,
    ];

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AutoRepair => "auto_repair",
            Self::CritiqueRevise => "critique_revise",
            Self::PartialRegeneration => "partial_regeneration",
            Self::ModelEscalation => "model_escalation",
            Self::EmergencyFallback => "emergency_fallback",
        }
    }
}

impl std::fmt::Display for RepairLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which layers a call site enables, and how persistent layer 2 is.
///
/// Layers are configured, not hard-coded into callers: a cheap stage may
/// enable only the free layers, an expensive one all five.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Enabled layers; attempted in canonical cascade order regardless of
    /// the order given here.
    pub enabled_layers: Vec<RepairLayer>,
    /// How many critique-revise rounds to run before falling through.
    pub max_revisions: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled_layers: RepairLayer::ALL.to_vec(),
            max_revisions: 2,
        }
    }
}

impl RepairConfig {
    /// Creates a config with all layers enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the cascade to the given layers.
    #[must_use]
    pub fn with_layers(mut self, layers: impl Into<Vec<RepairLayer>>) -> Self {
        self.enabled_layers = layers.into();
        self
    }

    /// Sets the critique-revise round budget.
    #[must_use]
    pub const fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    fn is_enabled(&self, layer: RepairLayer) -> bool {
        self.enabled_layers.contains(&layer)
    }
}

/// Context the model-backed layers need about the original task.
#[derive(Debug, Clone)]
pub struct RepairContext {
    /// The stage whose output is being repaired.
    pub stage: PipelineStage,
    /// Criticality used for model routing.
    pub criticality: TaskCriticality,
    /// The original generation prompt (layers 4 and 5 re-run it).
    pub task_prompt: String,
    /// The original system instruction, if any.
    pub system: Option<String>,
}

/// Record of one repair attempt, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAttempt {
    /// The layer that ran.
    pub layer: RepairLayer,
    /// The model used, if the layer called one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelHandle>,
    /// The validation or service error, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepairAttempt {
    /// Records a successful attempt.
    #[must_use]
    pub const fn succeeded(layer: RepairLayer, model: Option<ModelHandle>) -> Self {
        Self {
            layer,
            model,
            error: None,
        }
    }

    /// Records a failed attempt.
    #[must_use]
    pub fn failed(
        layer: RepairLayer,
        model: Option<ModelHandle>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            model,
            error: Some(error.into()),
        }
    }
}

/// A successfully repaired result.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// The schema-valid structured value.
    pub data: Value,
    /// The layer that produced it.
    pub layer_used: RepairLayer,
    /// Full attempt history, including the failures that preceded success.
    pub attempts: Vec<RepairAttempt>,
}

/// The five-layer repair cascade.
pub struct RepairCascade {
    completions: Arc<dyn CompletionService>,
    router: ModelRouter,
    config: RepairConfig,
    metrics: FlowMetrics,
}

impl RepairCascade {
    /// Creates a cascade over the given completion backend and routing.
    #[must_use]
    pub fn new(
        completions: Arc<dyn CompletionService>,
        router: ModelRouter,
        config: RepairConfig,
    ) -> Self {
        Self {
            completions,
            router,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Attempts to recover a schema-valid value from raw model output.
    ///
    /// # Errors
    ///
    /// - [`Error::RepairExhausted`] when every enabled layer failed; the
    ///   attempt history is attached for diagnostics.
    /// - [`Error::ServiceUnavailable`] when a model call failed transiently;
    ///   the worker retries the whole stage with backoff.
    #[tracing::instrument(
        skip(self, raw, schema, ctx),
        fields(stage = %ctx.stage, schema = %schema.name)
    )]
    pub async fn repair(
        &self,
        raw: &str,
        schema: &OutputSchema,
        ctx: &RepairContext,
    ) -> Result<RepairOutcome> {
        let mut attempts = Vec::new();

        for layer in RepairLayer::ALL {
            if !self.config.is_enabled(layer) {
                continue;
            }
            let candidate = match layer {
                RepairLayer::AutoRepair => self.try_auto(raw, schema, &mut attempts),
                RepairLayer::CritiqueRevise => {
                    self.try_critique(raw, schema, ctx, &mut attempts).await?
                }
                RepairLayer::PartialRegeneration => {
                    self.try_partial(raw, schema, ctx, &mut attempts).await?
                }
                RepairLayer::ModelEscalation => {
                    let model = self.router.escalation_model().clone();
                    self.try_rerun(layer, model, schema, ctx, &mut attempts)
                        .await?
                }
                RepairLayer::EmergencyFallback => {
                    let model = self.router.fallback_model().clone();
                    self.try_rerun(layer, model, schema, ctx, &mut attempts)
                        .await?
                }
            };

            if let Some(data) = candidate {
                tracing::debug!(layer = %layer, "repair cascade succeeded");
                self.record_attempts(&attempts);
                return Ok(RepairOutcome {
                    data,
                    layer_used: layer,
                    attempts,
                });
            }
        }

        tracing::warn!(attempts = attempts.len(), "repair cascade exhausted");
        self.record_attempts(&attempts);
        Err(Error::RepairExhausted { attempts })
    }

    fn record_attempts(&self, attempts: &[RepairAttempt]) {
        for attempt in attempts {
            let result = if attempt.error.is_none() {
                "succeeded"
            } else {
                "failed"
            };
            self.metrics
                .record_repair_attempt(attempt.layer.label(), result);
        }
    }

    fn try_auto(
        &self,
        raw: &str,
        schema: &OutputSchema,
        attempts: &mut Vec<RepairAttempt>,
    ) -> Option<Value> {
        match auto::auto_repair(raw, schema) {
            Some(value) => {
                attempts.push(RepairAttempt::succeeded(RepairLayer::AutoRepair, None));
                Some(value)
            }
            None => {
                attempts.push(RepairAttempt::failed(
                    RepairLayer::AutoRepair,
                    None,
                    describe_invalid(raw, schema),
                ));
                None
            }
        }
    }

    async fn try_critique(
        &self,
        raw: &str,
        schema: &OutputSchema,
        ctx: &RepairContext,
        attempts: &mut Vec<RepairAttempt>,
    ) -> Result<Option<Value>> {
        let model = self.router.model_for(ctx.stage, ctx.criticality).clone();
        let mut current = raw.to_string();

        for _ in 0..self.config.max_revisions {
            let error_text = describe_invalid(&current, schema);
            let prompt = critique_prompt(&current, &error_text, schema);
            let request = CompletionRequest::new(model.clone(), prompt);
            let response = match self.completions.complete(request).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    attempts.push(RepairAttempt::failed(
                        RepairLayer::CritiqueRevise,
                        Some(model.clone()),
                        e.to_string(),
                    ));
                    return Ok(None);
                }
            };

            if let Some(value) = auto::auto_repair(&response.text, schema) {
                attempts.push(RepairAttempt::succeeded(
                    RepairLayer::CritiqueRevise,
                    Some(response.model),
                ));
                return Ok(Some(value));
            }

            attempts.push(RepairAttempt::failed(
                RepairLayer::CritiqueRevise,
                Some(response.model),
                describe_invalid(&response.text, schema),
            ));
            current = response.text;
        }

        Ok(None)
    }

    async fn try_partial(
        &self,
        raw: &str,
        schema: &OutputSchema,
        ctx: &RepairContext,
        attempts: &mut Vec<RepairAttempt>,
    ) -> Result<Option<Value>> {
        // Partial regeneration needs a parseable base object to merge into.
        let base = auto::parse_lenient(raw).map(|v| auto::coerce_field_names(v, schema));
        let Some(Value::Object(mut base)) = base else {
            attempts.push(RepairAttempt::failed(
                RepairLayer::PartialRegeneration,
                None,
                "output is not parseable; nothing to preserve",
            ));
            return Ok(None);
        };

        let Err(violations) = schema.validate(&Value::Object(base.clone())) else {
            // Base already valid; earlier layers should have caught this,
            // but accept it rather than spending a model call.
            attempts.push(RepairAttempt::succeeded(RepairLayer::PartialRegeneration, None));
            return Ok(Some(Value::Object(base)));
        };

        let failed: Vec<String> = violations
            .failed_fields()
            .iter()
            .map(ToString::to_string)
            .collect();

        let model = self.router.model_for(ctx.stage, ctx.criticality).clone();
        let prompt = partial_prompt(&failed, schema, &ctx.task_prompt);
        let request = CompletionRequest::new(model.clone(), prompt);
        let response = match self.completions.complete(request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                attempts.push(RepairAttempt::failed(
                    RepairLayer::PartialRegeneration,
                    Some(model),
                    e.to_string(),
                ));
                return Ok(None);
            }
        };

        let Some(Value::Object(fragment)) = auto::parse_lenient(&response.text)
            .map(|v| auto::coerce_field_names(v, schema))
        else {
            attempts.push(RepairAttempt::failed(
                RepairLayer::PartialRegeneration,
                Some(response.model),
                "regenerated fragment is not a JSON object",
            ));
            return Ok(None);
        };

        for field in &failed {
            if let Some(value) = fragment.get(field) {
                base.insert(field.clone(), value.clone());
            }
        }

        let merged = Value::Object(base);
        match schema.validate(&merged) {
            Ok(()) => {
                attempts.push(RepairAttempt::succeeded(
                    RepairLayer::PartialRegeneration,
                    Some(response.model),
                ));
                Ok(Some(merged))
            }
            Err(violations) => {
                attempts.push(RepairAttempt::failed(
                    RepairLayer::PartialRegeneration,
                    Some(response.model),
                    violations.to_string(),
                ));
                Ok(None)
            }
        }
    }

    async fn try_rerun(
        &self,
        layer: RepairLayer,
        model: ModelHandle,
        schema: &OutputSchema,
        ctx: &RepairContext,
        attempts: &mut Vec<RepairAttempt>,
    ) -> Result<Option<Value>> {
        let mut request = CompletionRequest::new(model.clone(), ctx.task_prompt.clone());
        if let Some(system) = &ctx.system {
            request = request.with_system(system.clone());
        }

        let response = match self.completions.complete(request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                attempts.push(RepairAttempt::failed(layer, Some(model), e.to_string()));
                return Ok(None);
            }
        };

        match auto::auto_repair(&response.text, schema) {
            Some(value) => {
                attempts.push(RepairAttempt::succeeded(layer, Some(response.model)));
                Ok(Some(value))
            }
            None => {
                attempts.push(RepairAttempt::failed(
                    layer,
                    Some(response.model),
                    describe_invalid(&response.text, schema),
                ));
                Ok(None)
            }
        }
    }
}

/// Explains why a raw output is invalid, for critique prompts and attempt
/// records.
fn describe_invalid(raw: &str, schema: &OutputSchema) -> String {
    match auto::parse_lenient(raw) {
        None => "output is not parseable as JSON".to_string(),
        Some(value) => {
            let value = auto::coerce_field_names(value, schema);
            match schema.validate(&value) {
                Ok(()) => "output is valid".to_string(),
                Err(violations) => violations.to_string(),
            }
        }
    }
}

fn critique_prompt(raw: &str, error_text: &str, schema: &OutputSchema) -> String {
    format!(
        "Your previous response failed validation.\n\
         Validation error: {error_text}\n\n\
         Expected shape:\n{}\n\n\
         Previous response:\n{raw}\n\n\
         Respond with only the corrected JSON object, no commentary.",
        schema.describe()
    )
}

fn partial_prompt(failed: &[String], schema: &OutputSchema, task_prompt: &str) -> String {
    format!(
        "For the task below, respond with a JSON object containing ONLY \
         these fields: {}.\n\
         The fields must match this shape:\n{}\n\n\
         Task:\n{task_prompt}\n\n\
         Respond with only the JSON object, no commentary.",
        failed.join(", "),
        schema.describe()
    )
}

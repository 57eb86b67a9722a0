//! LLM-backed stage handler.
//!
//! [`LlmStageHandler`] is the production handler wired into every stage
//! queue: it runs the stage's generation prompt, routes the raw model
//! output through the repair cascade (never a raw parse), scores the
//! validated artifact against its requirements, and applies the configured
//! quality policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::{
    CompletionRequest, CompletionService, EmbeddingService, ModelRouter, TaskCriticality,
};
use crate::outbox::OutboxEntry;
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::quality::{CourseRequirements, GeneratedCourse, QualityConfig, QualityGate, QualityVerdict};
use crate::repair::{RepairCascade, RepairConfig, RepairContext, RepairLayer};
use crate::schema::OutputSchema;
use crate::state::PipelineStage;

/// What to do when the quality gate lands in the soft-warn band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPolicy {
    /// Treat soft-warn as failure; only a clean pass completes the stage.
    HardFail,
    /// Accept soft-warn output with a logged warning.
    WarnAndAccept,
}

/// The payload a stage job carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJob {
    /// The generation prompt for this stage.
    pub prompt: String,
    /// Optional system instruction.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub system: Option<String>,
    /// The requirements the generated content is scored against.
    pub requirements: CourseRequirements,
    /// Model-routing criticality.
    #[serde(default = "default_criticality")]
    pub criticality: TaskCriticality,
}

const fn default_criticality() -> TaskCriticality {
    TaskCriticality::Standard
}

impl StageJob {
    /// Serializes this job into an outbox payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decodes a job from an outbox payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed payloads.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// LLM-backed implementation of [`StageHandler`].
pub struct LlmStageHandler {
    completions: Arc<dyn CompletionService>,
    router: ModelRouter,
    cascade: RepairCascade,
    quality_retry: RepairCascade,
    gate: QualityGate,
    policy: QualityPolicy,
}

impl LlmStageHandler {
    /// Creates a handler over the given service seams.
    #[must_use]
    pub fn new(
        completions: Arc<dyn CompletionService>,
        embeddings: Arc<dyn EmbeddingService>,
        router: ModelRouter,
        repair_config: RepairConfig,
        quality_config: QualityConfig,
        policy: QualityPolicy,
    ) -> Self {
        let cascade = RepairCascade::new(
            Arc::clone(&completions),
            router.clone(),
            repair_config,
        );
        // Content that parses fine but scores poorly is regenerated on the
        // stronger models only; the structural layers cannot help it.
        let quality_retry = RepairCascade::new(
            Arc::clone(&completions),
            router.clone(),
            RepairConfig::new()
                .with_layers([RepairLayer::ModelEscalation, RepairLayer::EmergencyFallback]),
        );
        let gate = QualityGate::new(embeddings, quality_config);
        Self {
            completions,
            router,
            cascade,
            quality_retry,
            gate,
            policy,
        }
    }

    /// Applies the quality policy to a verdict.
    fn accepts(&self, verdict: QualityVerdict) -> bool {
        match verdict {
            QualityVerdict::Pass => true,
            QualityVerdict::SoftWarn => self.policy == QualityPolicy::WarnAndAccept,
            QualityVerdict::Fail => false,
        }
    }

    async fn score_artifact(
        &self,
        artifact: &Value,
        requirements: &CourseRequirements,
    ) -> Result<(bool, f64, f64, QualityVerdict)> {
        let generated = GeneratedCourse::from_artifact(artifact);
        let report = self.gate.score(&generated, requirements).await?;
        if report.verdict == QualityVerdict::SoftWarn && self.accepts(report.verdict) {
            tracing::warn!(
                overall = report.overall,
                threshold = report.thresholds.overall,
                "quality gate soft-warn accepted"
            );
        }
        Ok((
            self.accepts(report.verdict),
            report.overall,
            report.thresholds.overall,
            report.verdict,
        ))
    }
}

#[async_trait]
impl StageHandler for LlmStageHandler {
    #[tracing::instrument(
        skip(self, ctx, job),
        fields(course_id = %ctx.course.id, stage = %ctx.stage, attempt = ctx.attempt)
    )]
    async fn execute(&self, ctx: &StageContext, job: &OutboxEntry) -> Result<StageOutput> {
        let stage_job = StageJob::from_value(&job.job_data)?;
        let schema = OutputSchema::for_stage(ctx.stage);

        let model = self
            .router
            .model_for(ctx.stage, stage_job.criticality)
            .clone();
        let mut request = CompletionRequest::new(model, stage_job.prompt.clone());
        if let Some(system) = &stage_job.system {
            request = request.with_system(system.clone());
        }
        let response = self.completions.complete(request).await?;

        // Structural recovery: the raw output never gets a bare parse.
        let repair_ctx = RepairContext {
            stage: ctx.stage,
            criticality: stage_job.criticality,
            task_prompt: stage_job.prompt.clone(),
            system: stage_job.system.clone(),
        };
        let outcome = self
            .cascade
            .repair(&response.text, &schema, &repair_ctx)
            .await?;
        let mut artifact = outcome.data;

        // Semantic acceptance, with one regeneration round on stronger
        // models before the stage fails.
        let (accepted, overall, threshold, verdict) = self
            .score_artifact(&artifact, &stage_job.requirements)
            .await?;
        if !accepted {
            tracing::warn!(
                overall,
                threshold,
                verdict = ?verdict,
                "quality gate rejected artifact; regenerating"
            );
            let retry = self
                .quality_retry
                .repair(&response.text, &schema, &repair_ctx)
                .await?;
            let (retry_accepted, retry_overall, retry_threshold, _) = self
                .score_artifact(&retry.data, &stage_job.requirements)
                .await?;
            if !retry_accepted {
                return Err(Error::QualityGateFailed {
                    overall: retry_overall,
                    threshold: retry_threshold,
                });
            }
            artifact = retry.data;
        }

        let next_job_data = match ctx.stage.next() {
            Some(next_stage) => Some(
                StageJob {
                    prompt: next_prompt(next_stage, &artifact),
                    system: stage_job.system.clone(),
                    requirements: stage_job.requirements.clone(),
                    criticality: stage_job.criticality,
                }
                .to_value()?,
            ),
            None => None,
        };

        let mut output = StageOutput::new(artifact);
        if let Some(data) = next_job_data {
            output = output.with_next_job_data(data);
        }
        Ok(output)
    }
}

/// Builds the next stage's prompt around the previous stage's artifact.
fn next_prompt(stage: PipelineStage, artifact: &Value) -> String {
    let instruction = match stage {
        PipelineStage::Outline => "Generate the course outline.",
        PipelineStage::Sections => {
            "Write the lesson content for each section of this course outline."
        }
        PipelineStage::Assessments => {
            "Write assessment items for each section of this course content."
        }
    };
    format!(
        "{instruction}\n\nPrevious stage output:\n{}\n\n\
         Respond with only a JSON object matching the requested shape.",
        artifact
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::{Course, CourseMetadata};
    use crate::llm::{CompletionResponse, ModelHandle};
    use crate::outbox::JobSpec;
    use corso_core::{CourseId, OrganizationId};
    use std::sync::Mutex;

    /// Completion double that replays scripted responses.
    struct Scripted {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::service_unavailable("completion", "script exhausted"));
            }
            Ok(CompletionResponse {
                text: responses.remove(0),
                model: request.model,
            })
        }
    }

    /// Embedding double where every text maps to the same direction, so
    /// similarity is always 1.0 and the gate always passes.
    struct UniformEmbeddings;

    #[async_trait]
    impl EmbeddingService for UniformEmbeddings {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn handler(responses: Vec<&str>) -> LlmStageHandler {
        LlmStageHandler::new(
            Arc::new(Scripted {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }),
            Arc::new(UniformEmbeddings),
            ModelRouter::new(ModelHandle::new("standard-v1")),
            RepairConfig::default(),
            QualityConfig::default(),
            QualityPolicy::WarnAndAccept,
        )
    }

    fn ctx(stage: PipelineStage) -> StageContext {
        StageContext {
            course: Course::new(
                CourseId::generate(),
                OrganizationId::new_unchecked("acme-academy"),
                CourseMetadata::new("Intro to Soil Science", "en"),
                "user@example.com",
            ),
            stage,
            attempt: 1,
        }
    }

    fn job(stage: PipelineStage) -> OutboxEntry {
        let stage_job = StageJob {
            prompt: "Generate the course outline.".into(),
            system: None,
            requirements: CourseRequirements {
                summary: "Soil science fundamentals".into(),
                section_requirements: vec!["Basics".into()],
                language: "en".into(),
            },
            criticality: TaskCriticality::Standard,
        };
        OutboxEntry::from_spec(
            CourseId::generate(),
            &JobSpec::new(stage.queue_name(), stage_job.to_value().unwrap()),
        )
    }

    const VALID_OUTLINE: &str =
        r#"{"title": "Soil", "description": "Dirt", "sections": [{"heading": "Basics"}]}"#;

    #[tokio::test]
    async fn valid_output_produces_next_stage_payload() {
        let handler = handler(vec![VALID_OUTLINE]);
        let output = handler
            .execute(&ctx(PipelineStage::Outline), &job(PipelineStage::Outline))
            .await
            .unwrap();

        assert_eq!(output.artifact["title"], "Soil");
        let next = StageJob::from_value(&output.next_job_data.unwrap()).unwrap();
        assert!(next.prompt.contains("lesson content"));
        assert!(next.prompt.contains("Soil"));
    }

    #[tokio::test]
    async fn fenced_output_is_repaired_without_model_calls() {
        let fenced = format!("```json\n{VALID_OUTLINE}\n```");
        let handler = handler(vec![&fenced]);
        let output = handler
            .execute(&ctx(PipelineStage::Outline), &job(PipelineStage::Outline))
            .await
            .unwrap();
        assert_eq!(output.artifact["description"], "Dirt");
    }

    #[tokio::test]
    async fn error_prose_recovers_through_cascade() {
        let handler = handler(vec!["Error executing conversion: timeout", VALID_OUTLINE]);
        let output = handler
            .execute(&ctx(PipelineStage::Outline), &job(PipelineStage::Outline))
            .await
            .unwrap();
        assert_eq!(output.artifact["title"], "Soil");
    }

    #[tokio::test]
    async fn last_stage_has_no_next_payload() {
        let handler = handler(vec![r#"{"assessments": [{"q": "What is soil?"}]}"#]);
        let output = handler
            .execute(
                &ctx(PipelineStage::Assessments),
                &job(PipelineStage::Assessments),
            )
            .await
            .unwrap();
        assert!(output.next_job_data.is_none());
    }

    /// Embedding double where the generated metadata lands orthogonal to
    /// the requirement summary, dragging the weighted overall score below
    /// the fail line no matter how well the sections match.
    struct OrthogonalEmbeddings;

    #[async_trait]
    impl EmbeddingService for OrthogonalEmbeddings {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Requirement texts come from the job fixture.
            if text.contains("fundamentals") || text.contains("Basics") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    #[tokio::test]
    async fn poor_quality_regenerates_then_fails_the_stage() {
        // Structure is fine throughout; semantics never improve. After the
        // regeneration round on the stronger models the stage fails.
        let completions = Arc::new(Scripted {
            responses: Mutex::new(vec![VALID_OUTLINE.to_string(), VALID_OUTLINE.to_string()]),
        });
        let handler = LlmStageHandler::new(
            completions,
            Arc::new(OrthogonalEmbeddings),
            ModelRouter::new(ModelHandle::new("standard-v1"))
                .with_escalation(ModelHandle::new("large-v1")),
            RepairConfig::default(),
            QualityConfig::default(),
            QualityPolicy::WarnAndAccept,
        );

        let err = handler
            .execute(&ctx(PipelineStage::Outline), &job(PipelineStage::Outline))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QualityGateFailed { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_job_payload_is_a_permanent_error() {
        let handler = handler(vec![VALID_OUTLINE]);
        let bad_job = OutboxEntry::from_spec(
            CourseId::generate(),
            &JobSpec::new("course.outline", serde_json::json!({"not": "a stage job"})),
        );
        let err = handler
            .execute(&ctx(PipelineStage::Outline), &bad_job)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}

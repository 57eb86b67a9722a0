//! Semantic-similarity quality gate.
//!
//! Compares generated course content against the requirements that
//! motivated it, using embedding cosine similarity weighted across
//! sub-sections: course metadata against the requirement summary, and each
//! generated section against its requirement *by position* (never by
//! first-match, which silently rewards reordered content).
//!
//! ## Two-tier verdict
//!
//! A score at or above the overall threshold passes. A score within the
//! soft-warn margin below the threshold is a [`QualityVerdict::SoftWarn`]:
//! the caller may accept it with a logged warning instead of discarding
//! otherwise-acceptable output over a narrow miss. Anything lower fails and
//! the caller is expected to invoke the repair cascade or fail the stage —
//! never to treat it as a pass.
//!
//! ## Language adjustment
//!
//! Cross-lingual embedding similarity runs systematically lower, so all
//! thresholds are lowered by a configured offset for non-English content.
//! The weighting formula and the offset are deployment policy, carried in
//! [`QualityConfig`] rather than fixed constants.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::llm::EmbeddingService;
use crate::metrics::FlowMetrics;

/// Tunable weights and thresholds for the quality gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityConfig {
    /// Weight of the metadata similarity in the overall score.
    pub metadata_weight: f64,
    /// Weight of the mean section similarity in the overall score.
    pub section_weight: f64,
    /// Overall pass threshold.
    pub overall_threshold: f64,
    /// Per-part thresholds, reported for observability.
    pub metadata_threshold: f64,
    /// Per-section threshold, reported for observability.
    pub section_threshold: f64,
    /// Width of the soft-warn band below the overall threshold.
    pub soft_warn_margin: f64,
    /// Subtracted from every threshold for non-English content.
    pub non_english_adjustment: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            metadata_weight: 0.4,
            section_weight: 0.6,
            overall_threshold: 0.75,
            metadata_threshold: 0.80,
            section_threshold: 0.70,
            soft_warn_margin: 0.05,
            non_english_adjustment: 0.05,
        }
    }
}

impl QualityConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the metadata/section weights.
    #[must_use]
    pub const fn with_weights(mut self, metadata: f64, section: f64) -> Self {
        self.metadata_weight = metadata;
        self.section_weight = section;
        self
    }

    /// Sets the overall pass threshold.
    #[must_use]
    pub const fn with_overall_threshold(mut self, threshold: f64) -> Self {
        self.overall_threshold = threshold;
        self
    }

    /// Sets the non-English threshold adjustment.
    #[must_use]
    pub const fn with_non_english_adjustment(mut self, adjustment: f64) -> Self {
        self.non_english_adjustment = adjustment;
        self
    }
}

/// The requirements generated content is scored against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRequirements {
    /// Top-level description of what the course must cover.
    pub summary: String,
    /// Per-section requirements, in course order.
    pub section_requirements: Vec<String>,
    /// Content language as a lowercase ISO 639-1 tag.
    pub language: String,
}

impl CourseRequirements {
    /// Returns true if the content language is English.
    #[must_use]
    pub fn is_english(&self) -> bool {
        self.language == "en" || self.language.starts_with("en-")
    }
}

/// Generated content flattened to embeddable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCourse {
    /// Top-level metadata text (title, description, ...).
    pub metadata: String,
    /// Per-section content text, in course order.
    pub sections: Vec<String>,
}

impl GeneratedCourse {
    /// Flattens a stage artifact into embeddable text.
    ///
    /// Top-level string fields form the metadata text; the first top-level
    /// array field provides the sections, each flattened to its string
    /// content.
    #[must_use]
    pub fn from_artifact(artifact: &Value) -> Self {
        let Value::Object(map) = artifact else {
            return Self {
                metadata: artifact.to_string(),
                sections: Vec::new(),
            };
        };

        let metadata = map
            .values()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        let sections = map
            .values()
            .find_map(Value::as_array)
            .map(|items| items.iter().map(flatten_text).collect())
            .unwrap_or_default();

        Self { metadata, sections }
    }
}

fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .values()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// The gate's verdict on one scoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    /// At or above the overall threshold.
    Pass,
    /// Below threshold but within the soft-warn margin; acceptable per
    /// caller policy, with a logged warning.
    SoftWarn,
    /// Below the soft-warn band; the caller must not ship this.
    Fail,
}

/// The thresholds actually applied, after language adjustment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedThresholds {
    /// Overall threshold.
    pub overall: f64,
    /// Metadata threshold.
    pub metadata: f64,
    /// Per-section threshold.
    pub section: f64,
}

/// Full scoring breakdown for one gate invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    /// Weighted overall similarity.
    pub overall: f64,
    /// Metadata similarity.
    pub metadata_score: f64,
    /// Per-section similarities, positionally aligned with requirements.
    pub per_section_scores: Vec<f64>,
    /// The thresholds that were applied.
    pub thresholds: AppliedThresholds,
    /// The verdict.
    pub verdict: QualityVerdict,
    /// True when the verdict is [`QualityVerdict::Pass`].
    pub passed: bool,
}

/// Embedding-similarity quality gate.
pub struct QualityGate {
    embeddings: Arc<dyn EmbeddingService>,
    config: QualityConfig,
    metrics: FlowMetrics,
}

impl QualityGate {
    /// Creates a gate over the given embedding backend.
    #[must_use]
    pub fn new(embeddings: Arc<dyn EmbeddingService>, config: QualityConfig) -> Self {
        Self {
            embeddings,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Scores generated content against its requirements.
    ///
    /// # Errors
    ///
    /// Propagates embedding-service failures (retryable at the worker).
    #[tracing::instrument(skip(self, generated, requirements), fields(language = %requirements.language))]
    pub async fn score(
        &self,
        generated: &GeneratedCourse,
        requirements: &CourseRequirements,
    ) -> Result<QualityReport> {
        let metadata_score = self
            .similarity(&generated.metadata, &requirements.summary)
            .await?;

        let mut per_section_scores = Vec::with_capacity(requirements.section_requirements.len());
        for (position, requirement) in requirements.section_requirements.iter().enumerate() {
            let score = match generated.sections.get(position) {
                Some(section) => self.similarity(section, requirement).await?,
                // A missing section can never satisfy its requirement.
                None => 0.0,
            };
            per_section_scores.push(score);
        }

        let overall = if per_section_scores.is_empty() {
            metadata_score
        } else {
            let section_mean =
                per_section_scores.iter().sum::<f64>() / per_section_scores.len() as f64;
            let weight_sum = self.config.metadata_weight + self.config.section_weight;
            (self.config.metadata_weight * metadata_score
                + self.config.section_weight * section_mean)
                / weight_sum
        };

        let adjustment = if requirements.is_english() {
            0.0
        } else {
            self.config.non_english_adjustment
        };
        let thresholds = AppliedThresholds {
            overall: self.config.overall_threshold - adjustment,
            metadata: self.config.metadata_threshold - adjustment,
            section: self.config.section_threshold - adjustment,
        };

        let verdict = if overall >= thresholds.overall {
            QualityVerdict::Pass
        } else if overall >= thresholds.overall - self.config.soft_warn_margin {
            QualityVerdict::SoftWarn
        } else {
            QualityVerdict::Fail
        };

        let report = QualityReport {
            overall,
            metadata_score,
            per_section_scores,
            thresholds,
            verdict,
            passed: verdict == QualityVerdict::Pass,
        };
        let verdict_label = match verdict {
            QualityVerdict::Pass => "pass",
            QualityVerdict::SoftWarn => "soft_warn",
            QualityVerdict::Fail => "fail",
        };
        self.metrics.observe_quality_score(verdict_label, overall);
        tracing::debug!(
            overall = report.overall,
            verdict = ?report.verdict,
            "quality gate scored"
        );
        Ok(report)
    }

    async fn similarity(&self, a: &str, b: &str) -> Result<f64> {
        let va = self.embeddings.embed(a).await?;
        let vb = self.embeddings.embed(b).await?;
        Ok(cosine_similarity(&va, &vb))
    }
}

/// Cosine similarity of two vectors, 0.0 when either has no magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for i in 0..len {
        dot += f64::from(a[i]) * f64::from(b[i]);
        norm_a += f64::from(a[i]) * f64::from(a[i]);
        norm_b += f64::from(b[i]) * f64::from(b[i]);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

//! Transactional outbox entries.
//!
//! An outbox entry is one unit of pending background work, written in the
//! same transaction as the state change that spawned it. The outbox is what
//! makes the pipeline durable: a job is never lost (the transaction that
//! created the state also created the job) and never double-created (the
//! same transaction either committed once or not at all).
//!
//! ## Claim semantics
//!
//! An entry with `processed_at = null` is visible to exactly one consumer
//! at a time. Claims are leases: `claimed_by`/`claimed_at` mark the holder,
//! and a claim older than the store's visibility timeout expires so that a
//! crashed worker's entry becomes claimable again. A SQL-backed store
//! implements the same contract with `SELECT ... FOR UPDATE SKIP LOCKED`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use corso_core::{CourseId, OutboxEntryId};

/// Options controlling how a job is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Priority (lower = higher priority) used to order claims.
    pub priority: i32,
    /// Maximum in-process execution attempts before the stage fails.
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
        }
    }
}

impl JobOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the claim priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the maximum execution attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Specification of a job to enqueue alongside a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Which queue (stage/worker type) consumes this job.
    pub queue_name: String,
    /// Opaque job payload.
    pub job_data: serde_json::Value,
    /// Consumption options.
    #[serde(default)]
    pub options: JobOptions,
}

impl JobSpec {
    /// Creates a job spec with default options.
    #[must_use]
    pub fn new(queue_name: impl Into<String>, job_data: serde_json::Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_data,
            options: JobOptions::default(),
        }
    }

    /// Sets the job options.
    #[must_use]
    pub const fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// A durable record of one unit of pending background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Unique entry identifier.
    pub id: OutboxEntryId,
    /// The course this work belongs to.
    pub course_id: CourseId,
    /// Which queue consumes this entry.
    pub queue_name: String,
    /// Opaque job payload.
    pub job_data: serde_json::Value,
    /// Consumption options.
    pub options: JobOptions,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// Null until the entry has been consumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Identity of the current claim holder, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// When the current claim was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Creates a new unclaimed, unprocessed entry from a spec.
    #[must_use]
    pub fn from_spec(course_id: CourseId, spec: &JobSpec) -> Self {
        Self {
            id: OutboxEntryId::generate(),
            course_id,
            queue_name: spec.queue_name.clone(),
            job_data: spec.job_data.clone(),
            options: spec.options,
            created_at: Utc::now(),
            processed_at: None,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Returns true if the entry has been consumed.
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Returns true if the entry can be claimed at `now`.
    ///
    /// An unprocessed entry is claimable when it has no claim, or when its
    /// claim is older than `lease` (the holder is presumed crashed).
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.is_processed() {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(claimed_at) => claimed_at + lease < now,
        }
    }
}

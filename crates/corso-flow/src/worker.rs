//! Job dispatcher / worker.
//!
//! Workers continuously claim unprocessed outbox entries for the queues
//! they serve and drive the claimed course through its stage:
//!
//! 1. claim an entry (at most one active claim per entry, via the lease)
//! 2. move the course into the stage (`_init -> _processing`, entering
//!    `_init` from the previous stage's `_complete` first if the claim is
//!    the one advancing it; every step guarded by expected state)
//! 3. run the stage handler, retrying transient failures with backoff
//! 4. on success, in one transaction: consume the entry, write
//!    `_processing -> _complete`, and enqueue the next stage's `_init` job
//! 5. on permanent failure, transition the course to `failed` with the
//!    retained error
//!
//! Cancellation is checked before execution and between retry attempts; at
//! completion time the state machine enforces it regardless (`cancelled`
//! only permits `pending`), so a stale worker cannot overwrite a
//! cancellation no matter when it lands.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use corso_core::CourseId;

use crate::course::{Course, StageFailure};
use crate::error::{Error, Result};
use crate::events::Actor;
use crate::metrics::FlowMetrics;
use crate::outbox::{JobSpec, OutboxEntry};
use crate::pipeline::{HandlerRegistry, StageContext, StageOutput};
use crate::state::{CourseState, PipelineStage};
use crate::store::{Store, TransitionRequest};

/// Bounded exponential backoff for transient handler failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before the given retry (1-indexed attempt that
    /// just failed).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(2_u32.saturating_pow(exp));
        delay.min(self.max_backoff)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Claimant identity recorded on claims.
    pub claimant: String,
    /// Queues served, polled in order.
    pub queues: Vec<String>,
    /// Sleep between idle polls.
    pub poll_interval: Duration,
    /// Backoff policy for transient handler failures.
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    /// Creates a config serving every pipeline stage queue.
    #[must_use]
    pub fn new(claimant: impl Into<String>) -> Self {
        Self {
            claimant: claimant.into(),
            queues: PipelineStage::ALL
                .iter()
                .map(|s| s.queue_name().to_string())
                .collect(),
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }

    /// Restricts the worker to specific queues.
    #[must_use]
    pub fn with_queues(mut self, queues: impl Into<Vec<String>>) -> Self {
        self.queues = queues.into();
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What one worker tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No claimable entry on any served queue.
    Idle,
    /// A stage completed and the course advanced.
    StageCompleted {
        /// The course that advanced.
        course_id: CourseId,
        /// The stage that completed.
        stage: PipelineStage,
    },
    /// A stage failed permanently and the course is now `failed`.
    CourseFailed {
        /// The course that failed.
        course_id: CourseId,
        /// The stage that failed.
        stage: PipelineStage,
    },
    /// A claimed entry was dropped because the course had been cancelled
    /// or had otherwise moved on.
    SkippedStale {
        /// The course whose entry was dropped.
        course_id: CourseId,
    },
}

/// A pipeline worker.
pub struct Worker<S> {
    store: Arc<S>,
    registry: HandlerRegistry,
    config: WorkerConfig,
    metrics: FlowMetrics,
}

impl<S: Store> Worker<S> {
    /// Creates a worker over the given store and handlers.
    #[must_use]
    pub fn new(store: Arc<S>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Claims and processes at most one entry.
    ///
    /// # Errors
    ///
    /// Returns infrastructure errors only; a permanently failed stage is
    /// the [`TickOutcome::CourseFailed`] outcome, not an `Err`.
    pub async fn tick(&self) -> Result<TickOutcome> {
        for queue in &self.config.queues {
            let claimed = self
                .store
                .claim_next(queue, &self.config.claimant, Utc::now())
                .await?;
            if let Some(entry) = claimed {
                return self.process(entry).await;
            }
        }
        Ok(TickOutcome::Idle)
    }

    /// Ticks until every served queue is drained, returning how many
    /// entries were processed. Primarily for tests and batch draining.
    ///
    /// # Errors
    ///
    /// Propagates the first infrastructure error.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        loop {
            match self.tick().await? {
                TickOutcome::Idle => return Ok(processed),
                _ => processed += 1,
            }
        }
    }

    /// Runs the claim loop until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Propagates the first infrastructure error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.tick().await? {
                TickOutcome::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                outcome => {
                    tracing::debug!(?outcome, "worker tick");
                }
            }
        }
    }

    #[tracing::instrument(
        skip(self, entry),
        fields(course_id = %entry.course_id, queue = %entry.queue_name, claimant = %self.config.claimant)
    )]
    async fn process(&self, entry: OutboxEntry) -> Result<TickOutcome> {
        let Some(stage) = PipelineStage::for_queue(&entry.queue_name) else {
            // Unknown queue: consume the entry so it cannot wedge the queue.
            self.store.mark_processed(&entry.id, Utc::now()).await?;
            return Err(Error::storage(format!(
                "no pipeline stage for queue {}",
                entry.queue_name
            )));
        };

        let Some(course) = self.store.get_course(&entry.course_id).await? else {
            self.store.mark_processed(&entry.id, Utc::now()).await?;
            return Err(Error::CourseNotFound {
                course_id: entry.course_id,
            });
        };

        // Pre-execution cancellation / staleness check. The course is
        // either already in this stage's init state, or resting in the
        // previous stage's complete state (the claim moves it forward).
        // Anything else means the entry is stale.
        let course = if course.state == stage.init_state() {
            course
        } else if course.state == stage.pre_init_state() {
            match self
                .transition(&course, stage.init_state(), Some(course.state))
                .await
            {
                Ok(course) => course,
                Err(e) => return self.abort_if_cancelled(entry, e).await,
            }
        } else {
            tracing::info!(state = %course.state, "dropping stale entry");
            self.store.mark_processed(&entry.id, Utc::now()).await?;
            self.metrics.record_job(&entry.queue_name, "stale");
            return Ok(TickOutcome::SkippedStale {
                course_id: entry.course_id,
            });
        };

        let course = match self
            .transition(&course, stage.processing_state(), Some(stage.init_state()))
            .await
        {
            Ok(course) => course,
            Err(e) => return self.abort_if_cancelled(entry, e).await,
        };

        let started = std::time::Instant::now();
        match self.execute_with_retry(stage, course, &entry).await? {
            Executed::Output(course, output) => {
                let outcome = self.complete_stage(&entry, stage, &course, output).await;
                self.metrics.observe_stage_duration(
                    stage.label(),
                    "completed",
                    started.elapsed().as_secs_f64(),
                );
                outcome
            }
            Executed::Aborted(course_id) => Ok(TickOutcome::SkippedStale { course_id }),
            Executed::Failed(course, error) => {
                let outcome = self.fail_stage(&entry, stage, &course, &error).await;
                self.metrics.observe_stage_duration(
                    stage.label(),
                    "failed",
                    started.elapsed().as_secs_f64(),
                );
                outcome
            }
        }
    }

    async fn execute_with_retry(
        &self,
        stage: PipelineStage,
        mut course: Course,
        entry: &OutboxEntry,
    ) -> Result<Executed> {
        let Some(handler) = self.registry.get(&entry.queue_name) else {
            return Ok(Executed::Failed(
                course,
                Error::storage(format!("no handler registered for {}", entry.queue_name)),
            ));
        };

        let max_attempts = entry.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let ctx = StageContext {
                course: course.clone(),
                stage,
                attempt,
            };
            match handler.execute(&ctx, entry).await {
                Ok(output) => return Ok(Executed::Output(course, output)),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(error = %e, attempt, "transient stage failure, backing off");
                    self.metrics.record_retry(stage.label());
                    tokio::time::sleep(self.config.retry.backoff_for(attempt)).await;

                    // Cancellation check between sub-steps: abort instead
                    // of continuing to mutate a cancelled course.
                    let fresh = self
                        .store
                        .get_course(&course.id)
                        .await?
                        .ok_or(Error::CourseNotFound { course_id: course.id })?;
                    if fresh.state == CourseState::Cancelled {
                        self.store.mark_processed(&entry.id, Utc::now()).await?;
                        return Ok(Executed::Aborted(course.id));
                    }
                    course = fresh;
                    attempt += 1;
                }
                Err(e) => return Ok(Executed::Failed(course, e)),
            }
        }
    }

    async fn complete_stage(
        &self,
        entry: &OutboxEntry,
        stage: PipelineStage,
        course: &Course,
        output: StageOutput,
    ) -> Result<TickOutcome> {
        let jobs = match stage.next() {
            Some(next) => {
                let job_data = output
                    .next_job_data
                    .unwrap_or_else(|| entry.job_data.clone());
                vec![JobSpec::new(next.queue_name(), job_data)
                    .with_options(entry.options)]
            }
            None => Vec::new(),
        };

        let request = TransitionRequest::new(
            course.id,
            course.organization_id.clone(),
            stage.complete_state(),
            Actor::Worker,
        )
        .expecting(stage.processing_state())
        .consuming(entry.id)
        .with_jobs(jobs);

        let completed = match self.store.transition_and_enqueue(request).await {
            Ok(outcome) => outcome.course,
            Err(e) => return self.abort_if_cancelled(entry.clone(), e).await,
        };
        self.metrics
            .record_transition(stage.processing_state().as_str(), completed.state.as_str());
        self.metrics.record_job(&entry.queue_name, "completed");

        // The last stage also finalizes the course.
        if stage.next().is_none() {
            let finalizing = self
                .transition(&completed, CourseState::Finalizing, Some(stage.complete_state()))
                .await?;
            self.transition(&finalizing, CourseState::Completed, Some(CourseState::Finalizing))
                .await?;
            tracing::info!(course_id = %completed.id, "course completed");
        }

        Ok(TickOutcome::StageCompleted {
            course_id: course.id,
            stage,
        })
    }

    async fn fail_stage(
        &self,
        entry: &OutboxEntry,
        stage: PipelineStage,
        course: &Course,
        error: &Error,
    ) -> Result<TickOutcome> {
        tracing::error!(error = %error, stage = %stage, "stage failed permanently");
        let request = TransitionRequest::new(
            course.id,
            course.organization_id.clone(),
            CourseState::Failed,
            Actor::Worker,
        )
        .consuming(entry.id)
        .with_failure(StageFailure::new(Some(stage), error.to_string()));

        match self.store.transition_and_enqueue(request).await {
            Ok(_) => {
                self.metrics.record_job(&entry.queue_name, "failed");
                Ok(TickOutcome::CourseFailed {
                    course_id: course.id,
                    stage,
                })
            }
            Err(e) => self.abort_if_cancelled(entry.clone(), e).await,
        }
    }

    /// A transition that lost to a concurrent cancellation is an abort,
    /// not an infrastructure error; anything else propagates. The entry is
    /// consumed either way so it cannot wedge the queue.
    async fn abort_if_cancelled(&self, entry: OutboxEntry, error: Error) -> Result<TickOutcome> {
        if !matches!(error, Error::InvalidTransition { .. }) {
            return Err(error);
        }
        let current = self.store.get_course(&entry.course_id).await?;
        match current {
            Some(course) if course.state == CourseState::Cancelled => {
                tracing::info!(course_id = %course.id, "aborting: course was cancelled mid-stage");
                self.store.mark_processed(&entry.id, Utc::now()).await?;
                self.metrics.record_job(&entry.queue_name, "cancelled");
                Ok(TickOutcome::SkippedStale {
                    course_id: entry.course_id,
                })
            }
            _ => Err(error),
        }
    }

    async fn transition(
        &self,
        course: &Course,
        target: CourseState,
        expected: Option<CourseState>,
    ) -> Result<Course> {
        let mut request = TransitionRequest::new(
            course.id,
            course.organization_id.clone(),
            target,
            Actor::Worker,
        );
        if let Some(expected) = expected {
            request = request.expecting(expected);
        }
        let outcome = self.store.transition_and_enqueue(request).await?;
        self.metrics
            .record_transition(course.state.as_str(), target.as_str());
        Ok(outcome.course)
    }
}

enum Executed {
    Output(Course, StageOutput),
    Aborted(CourseId),
    Failed(Course, Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(500));
    }

    #[test]
    fn worker_config_serves_all_queues_by_default() {
        let config = WorkerConfig::new("worker-1");
        assert_eq!(
            config.queues,
            vec!["course.outline", "course.sections", "course.assessments"]
        );
    }
}

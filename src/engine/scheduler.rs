//! The scheduler loop — drives tasks from pending to completed.
//!
//! A single cooperative loop drains one pending task at a time, strictly in
//! creation-time order across all jobs, so jobs interleave at task
//! granularity. The loop suspends only when no pending task exists and
//! checks for cancellation at that suspension point; an in-flight handler is
//! never preempted.
//!
//! One scheduler instance per database is assumed. There is no cross-process
//! mutual exclusion; running two loops against the same store is
//! unsupported.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::engine::dispatch::{HandlerContext, HandlerSet};
use crate::error::{DatabaseError, Error, TaskError};
use crate::jobs::model::{JobStatus, JobTask, TaskStatus};
use crate::jobs::{JobStore, VersionStore};
use crate::registry::TaskRegistry;

/// The orchestration control loop.
pub struct Scheduler {
    jobs: JobStore,
    versions: VersionStore,
    registry: Arc<TaskRegistry>,
    handlers: Arc<HandlerSet>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler. All collaborators are injected; the scheduler
    /// keeps no global state.
    pub fn new(
        jobs: JobStore,
        versions: VersionStore,
        registry: Arc<TaskRegistry>,
        handlers: Arc<HandlerSet>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            versions,
            registry,
            handlers,
            config,
        }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Task-level failures are absorbed into `failed` status; loop-level
    /// errors (e.g. storage unreachable) are logged and followed by a longer
    /// backoff. The loop itself never terminates on a single task's failure.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.step().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Scheduler iteration failed");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!("Scheduler loop stopped");
    }

    /// Drain at most one pending task. Returns whether any work was done.
    pub async fn step(&self) -> Result<bool, Error> {
        let Some(task) = self.jobs.next_pending_task().await.map_err(Error::from)? else {
            return Ok(false);
        };
        self.process(&task).await?;
        Ok(true)
    }

    /// Execute one task end to end: handler (with retry), version write,
    /// status transition, and pipeline advancement.
    async fn process(&self, task: &JobTask) -> Result<(), Error> {
        info!(
            job_id = %task.job_id,
            task_id = %task.id,
            task_type = %task.kind,
            "Processing task"
        );

        match self.execute_with_retry(task).await {
            Ok(result) => {
                let version_id = self.versions.record_completion(task.id, &result).await?;
                info!(
                    job_id = %task.job_id,
                    task_id = %task.id,
                    version_id,
                    "Task completed"
                );
                self.advance(task).await?;
            }
            Err(err) => {
                error!(
                    job_id = %task.job_id,
                    task_id = %task.id,
                    task_type = %task.kind,
                    error = %err,
                    "Task failed; marking failed"
                );
                self.jobs
                    .update_task_status(task.id, TaskStatus::Failed)
                    .await?;
            }
        }

        Ok(())
    }

    /// Run the task's handler, retrying transient failures with exponential
    /// backoff up to the configured attempt budget.
    async fn execute_with_retry(&self, task: &JobTask) -> Result<Value, TaskError> {
        let handler = self.handlers.get(task.kind)?;
        let ctx = HandlerContext::new(
            task.job_id,
            task.id,
            self.jobs.clone(),
            self.versions.clone(),
        );

        let mut attempt = 1u32;
        loop {
            match handler.run(&ctx).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = exponential_delay(&self.config, attempt) + jitter();
                    warn!(
                        job_id = %task.job_id,
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient task failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        job_id = %task.job_id,
                        task_id = %task.id,
                        attempt,
                        error = %err,
                        "Task execution gave up"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// After a completion: unlock the next stage, or finish the job if the
    /// terminal stage just landed.
    async fn advance(&self, task: &JobTask) -> Result<(), Error> {
        let next_order = task.task_order + 1;

        if (next_order as usize) < self.registry.len() {
            match self.jobs.task_by_order(task.job_id, next_order).await? {
                // Only a blocked task is unlocked here; a failed one stays
                // failed until an explicit re-run.
                Some(next) if next.status == TaskStatus::Blocked => {
                    self.jobs
                        .update_task_status(next.id, TaskStatus::Pending)
                        .await?;
                    debug!(
                        job_id = %task.job_id,
                        task_id = %next.id,
                        task_type = %next.kind,
                        "Unlocked next task"
                    );
                }
                Some(_) => {}
                None => {
                    warn!(
                        job_id = %task.job_id,
                        task_order = next_order,
                        "Pipeline has no task at expected position"
                    );
                }
            }
            return Ok(());
        }

        let unfinished = self.jobs.count_unfinished(task.job_id).await?;
        if unfinished == 0 {
            self.jobs
                .update_job_status(task.job_id, JobStatus::Completed)
                .await?;
            info!(job_id = %task.job_id, "Job completed");

            if let Some(overview) = self.jobs.overview(task.job_id).await? {
                debug!(
                    job_id = %task.job_id,
                    tasks = overview.tasks.len(),
                    "Final job state recorded"
                );
            }
        } else {
            debug!(
                job_id = %task.job_id,
                unfinished,
                "Terminal task done but earlier stages remain"
            );
        }

        Ok(())
    }

    /// Manually re-drive a task, independent of the loop.
    ///
    /// Runs the handler once (no retry envelope), appends a fresh version,
    /// moves the current-version pointer, and marks the task `completed`.
    /// Historical versions are untouched. Returns the new version id.
    pub async fn rerun_task(&self, task_id: Uuid) -> Result<i64, Error> {
        let task = self
            .jobs
            .task(task_id)
            .await?
            .ok_or(Error::Database(DatabaseError::NotFound {
                entity: "job_task".to_string(),
                id: task_id.to_string(),
            }))?;

        let handler = self.handlers.get(task.kind).map_err(Error::from)?;
        let ctx = HandlerContext::new(
            task.job_id,
            task.id,
            self.jobs.clone(),
            self.versions.clone(),
        );

        let result = handler.run(&ctx).await.map_err(Error::from)?;
        let version_id = self.versions.record_completion(task.id, &result).await?;
        info!(
            job_id = %task.job_id,
            task_id = %task.id,
            version_id,
            "Task re-run complete"
        );
        Ok(version_id)
    }
}

/// Deterministic part of the backoff schedule: base · 2^(attempt−1), capped.
fn exponential_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let shift = (attempt.saturating_sub(1)).min(16);
    config
        .retry_base_delay
        .saturating_mul(1u32 << shift)
        .min(config.retry_max_delay)
}

/// Small random spread so simultaneous retries don't stampede a provider.
fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=250))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = SchedulerConfig {
            retry_base_delay: Duration::from_secs(4),
            retry_max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(exponential_delay(&config, 1), Duration::from_secs(4));
        assert_eq!(exponential_delay(&config, 2), Duration::from_secs(8));
        assert_eq!(exponential_delay(&config, 3), Duration::from_secs(10));
        assert_eq!(exponential_delay(&config, 30), Duration::from_secs(10));
    }
}

//! Handler dispatch — maps task types to the code that computes their
//! results.
//!
//! Handlers are registered explicitly at startup and injected into the
//! scheduler; nothing is discovered by naming convention. A handler reads
//! upstream data only through its [`HandlerContext`] and communicates with
//! the engine solely by returning a result value for versioning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::jobs::model::TaskStatus;
use crate::jobs::{JobStore, VersionStore};
use crate::registry::TaskKind;

/// Implements one task type's computation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type this handler serves.
    fn kind(&self) -> TaskKind;

    /// Compute the task's result from the job payload and upstream results.
    async fn run(&self, ctx: &HandlerContext) -> Result<Value, TaskError>;
}

/// Per-invocation view of the engine handed to a handler.
pub struct HandlerContext {
    pub job_id: Uuid,
    pub task_id: Uuid,
    jobs: JobStore,
    versions: VersionStore,
}

impl HandlerContext {
    pub fn new(job_id: Uuid, task_id: Uuid, jobs: JobStore, versions: VersionStore) -> Self {
        Self {
            job_id,
            task_id,
            jobs,
            versions,
        }
    }

    /// The job's submission payload.
    pub async fn job_payload(&self) -> Result<Value, TaskError> {
        let job = self.jobs.get_job(self.job_id).await?.ok_or_else(|| {
            TaskError::Database(crate::error::DatabaseError::NotFound {
                entity: "job".to_string(),
                id: self.job_id.to_string(),
            })
        })?;
        Ok(job.data)
    }

    /// Result of the job's completed task of the given kind, read through
    /// the current-version pointer.
    ///
    /// Fails with `UpstreamNotReady` if the task is absent, not completed,
    /// or has no version yet — the scheduler treats that as retryable, since
    /// the dependency may land shortly.
    pub async fn upstream(&self, kind: TaskKind) -> Result<Value, TaskError> {
        let not_ready = || TaskError::UpstreamNotReady {
            job_id: self.job_id,
            kind: kind.as_str().to_string(),
        };

        let tasks = self.jobs.tasks_for(self.job_id).await?;
        let task = tasks
            .iter()
            .find(|t| t.kind == kind && t.status == TaskStatus::Completed)
            .ok_or_else(not_ready)?;

        let record = self
            .versions
            .get_version(task.id, None)
            .await?
            .ok_or_else(not_ready)?;
        Ok(record.result)
    }
}

/// Explicit task-type → handler mapping, fixed after startup.
#[derive(Default)]
pub struct HandlerSet {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its declared kind. Last registration wins.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind();
        self.handlers.insert(kind, handler);
        tracing::debug!(task_type = %kind, "Registered task handler");
    }

    /// Builder-style registration.
    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Look up the handler for a task type.
    pub fn get(&self, kind: TaskKind) -> Result<&Arc<dyn TaskHandler>, TaskError> {
        self.handlers
            .get(&kind)
            .ok_or_else(|| TaskError::UnknownType(kind.as_str().to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

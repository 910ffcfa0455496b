//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, JobTask, TaskStatus, VersionMeta, VersionRecord};

/// Backend-agnostic database trait covering jobs, tasks, task versions, and
/// the keyword search cache.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs & tasks ────────────────────────────────────────────────

    /// Insert a job together with its full task list, atomically.
    async fn insert_job_with_tasks(
        &self,
        job: &Job,
        tasks: &[JobTask],
    ) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Update a job's status (and `updated_at`).
    async fn update_job_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError>;

    /// Delete a job and its tasks. Task versions are deliberately left in
    /// place for forensics.
    async fn delete_job(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<JobTask>, DatabaseError>;

    /// All tasks for a job, ordered by `task_order`.
    async fn list_tasks_for_job(&self, job_id: Uuid) -> Result<Vec<JobTask>, DatabaseError>;

    /// The task at a given pipeline position within a job.
    async fn task_by_order(
        &self,
        job_id: Uuid,
        task_order: i64,
    ) -> Result<Option<JobTask>, DatabaseError>;

    /// The single oldest pending task across all jobs, by creation time.
    async fn next_pending_task(&self) -> Result<Option<JobTask>, DatabaseError>;

    /// Update a task's status (and `updated_at`).
    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError>;

    /// Number of a job's tasks not yet `completed`.
    async fn count_unfinished_tasks(&self, job_id: Uuid) -> Result<i64, DatabaseError>;

    // ── Task versions ───────────────────────────────────────────────

    /// Append an immutable version and move the current-version pointer to
    /// it, in one transaction. Returns the new version id.
    async fn insert_version(&self, task_id: Uuid, result: &Value) -> Result<i64, DatabaseError>;

    /// Append a version, move the pointer, and mark the task `completed`,
    /// all in one transaction. Returns the new version id.
    async fn complete_task(&self, task_id: Uuid, result: &Value) -> Result<i64, DatabaseError>;

    /// The version the current-version pointer designates, if any.
    async fn current_version(&self, task_id: Uuid)
    -> Result<Option<VersionRecord>, DatabaseError>;

    /// A specific version of a task's history.
    async fn version(
        &self,
        task_id: Uuid,
        version_id: i64,
    ) -> Result<Option<VersionRecord>, DatabaseError>;

    /// Version history for a task, oldest first.
    async fn list_versions(&self, task_id: Uuid) -> Result<Vec<VersionMeta>, DatabaseError>;

    // ── Keyword search cache ────────────────────────────────────────

    /// Cached provider response for a (keyword, location) pair, if present.
    async fn cached_keyword_search(
        &self,
        keyword: &str,
        location: &str,
    ) -> Result<Option<Value>, DatabaseError>;

    /// Store (or refresh) a provider response for a (keyword, location) pair.
    async fn cache_keyword_search(
        &self,
        keyword: &str,
        location: &str,
        response: &Value,
    ) -> Result<(), DatabaseError>;
}

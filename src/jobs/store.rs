//! JobStore — provisioning and status transitions for jobs and their tasks.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, JobTask, TaskStatus};
use crate::registry::TaskRegistry;
use crate::store::Database;

/// Typed front over the database for job and task records.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<dyn Database>,
    registry: Arc<TaskRegistry>,
}

/// Audit view of one task: its record plus the current result, if any.
#[derive(Debug, Clone)]
pub struct TaskOverview {
    pub task: JobTask,
    pub result: Option<Value>,
}

/// Audit view of a job and all its tasks.
#[derive(Debug, Clone)]
pub struct JobOverview {
    pub job: Job,
    pub tasks: Vec<TaskOverview>,
}

impl JobStore {
    pub fn new(db: Arc<dyn Database>, registry: Arc<TaskRegistry>) -> Self {
        Self { db, registry }
    }

    /// Create a job from a submission payload.
    ///
    /// Provisions one task per registry entry, in registry order, in the same
    /// transaction as the job row. Only the first task starts `pending`; the
    /// rest are `blocked` until the scheduler unlocks them.
    pub async fn create_job(&self, payload: Value) -> Result<Uuid, DatabaseError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            data: payload,
            created_at: now,
            updated_at: now,
        };

        let tasks: Vec<JobTask> = self
            .registry
            .kinds()
            .enumerate()
            .map(|(order, kind)| JobTask {
                id: Uuid::new_v4(),
                job_id: job.id,
                kind,
                task_order: order as i64,
                status: if order == 0 {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Blocked
                },
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.db.insert_job_with_tasks(&job, &tasks).await?;
        info!(job_id = %job.id, tasks = tasks.len(), "Job created");
        Ok(job.id)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.db.get_job(id).await
    }

    /// All tasks for a job, ordered by pipeline position.
    pub async fn tasks_for(&self, job_id: Uuid) -> Result<Vec<JobTask>, DatabaseError> {
        self.db.list_tasks_for_job(job_id).await
    }

    pub async fn task(&self, id: Uuid) -> Result<Option<JobTask>, DatabaseError> {
        self.db.get_task(id).await
    }

    pub async fn task_by_order(
        &self,
        job_id: Uuid,
        task_order: i64,
    ) -> Result<Option<JobTask>, DatabaseError> {
        self.db.task_by_order(job_id, task_order).await
    }

    /// The single oldest pending task across all jobs.
    pub async fn next_pending_task(&self) -> Result<Option<JobTask>, DatabaseError> {
        self.db.next_pending_task().await
    }

    /// Number of a job's tasks not yet completed.
    pub async fn count_unfinished(&self, job_id: Uuid) -> Result<i64, DatabaseError> {
        self.db.count_unfinished_tasks(job_id).await
    }

    pub async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), DatabaseError> {
        self.db.update_task_status(id, status).await
    }

    pub async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> Result<(), DatabaseError> {
        self.db.update_job_status(id, status).await
    }

    /// Remove a job and its tasks after an unrecoverable provisioning error.
    ///
    /// Versions already written for the job's tasks are left orphaned on
    /// purpose — they are the only forensic record of what happened.
    pub async fn rollback_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.db.delete_job(id).await?;
        warn!(job_id = %id, "Job rolled back");
        Ok(())
    }

    /// Job plus per-task status and current result — the audit view.
    pub async fn overview(&self, job_id: Uuid) -> Result<Option<JobOverview>, DatabaseError> {
        let Some(job) = self.db.get_job(job_id).await? else {
            debug!(job_id = %job_id, "No job found for overview");
            return Ok(None);
        };

        let mut tasks = Vec::new();
        for task in self.db.list_tasks_for_job(job_id).await? {
            let result = self
                .db
                .current_version(task.id)
                .await?
                .map(|v| v.result);
            tasks.push(TaskOverview { task, result });
        }

        Ok(Some(JobOverview { job, tasks }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn store() -> JobStore {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        JobStore::new(db, Arc::new(TaskRegistry::standard()))
    }

    #[tokio::test]
    async fn create_job_provisions_one_task_per_registry_entry() {
        let store = store().await;
        let job_id = store.create_job(json!({"companyName": "Acme"})).await.unwrap();

        let tasks = store.tasks_for(job_id).await.unwrap();
        assert_eq!(tasks.len(), 6);
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.task_order, i as i64);
        }
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[1..].iter().all(|t| t.status == TaskStatus::Blocked));
    }

    #[tokio::test]
    async fn overview_includes_current_results() {
        let store = store().await;
        let job_id = store.create_job(json!({})).await.unwrap();
        let tasks = store.tasks_for(job_id).await.unwrap();

        let overview = store.overview(job_id).await.unwrap().unwrap();
        assert_eq!(overview.tasks.len(), 6);
        assert!(overview.tasks.iter().all(|t| t.result.is_none()));

        store
            .db
            .complete_task(tasks[0].id, &json!({"ok": true}))
            .await
            .unwrap();
        let overview = store.overview(job_id).await.unwrap().unwrap();
        assert_eq!(overview.tasks[0].result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn rollback_removes_job_and_tasks() {
        let store = store().await;
        let job_id = store.create_job(json!({})).await.unwrap();

        store.rollback_job(job_id).await.unwrap();
        assert!(store.get_job(job_id).await.unwrap().is_none());
        assert!(store.tasks_for(job_id).await.unwrap().is_empty());
    }
}

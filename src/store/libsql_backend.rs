//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every multi-statement write
//! (job provisioning, version + pointer, completion) runs in an explicit
//! transaction; an uncommitted transaction rolls back on drop, so a storage
//! error leaves no partial write observable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, JobTask, TaskStatus, VersionMeta, VersionRecord};
use crate::registry::TaskKind;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
        })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self) -> Result<libsql::Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Failed to begin transaction: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_job_status(s: &str) -> JobStatus {
    match s {
        "completed" => JobStatus::Completed,
        _ => JobStatus::Pending,
    }
}

/// Parse a task status string from the DB. Unknown values map to `Blocked`,
/// which keeps a corrupt row out of the scheduler's pending queue.
fn str_to_task_status(s: &str) -> TaskStatus {
    match s {
        "pending" => TaskStatus::Pending,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Blocked,
    }
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("Bad {entity} id {s:?}: {e}")))
}

fn parse_json(s: Option<String>) -> Result<Value, DatabaseError> {
    match s {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| DatabaseError::Serialization(format!("Bad JSON column: {e}"))),
        None => Ok(Value::Null),
    }
}

/// Map a libsql row to a Job.
///
/// Column order: 0:id, 1:status, 2:data, 3:created_at, 4:updated_at
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let status: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let data: Option<String> = row.get(2).ok();
    let created: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let updated: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(Job {
        id: parse_uuid(&id, "job")?,
        status: str_to_job_status(&status),
        data: parse_json(data)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql row to a JobTask.
///
/// Column order: 0:id, 1:job_id, 2:task_type, 3:task_order, 4:status,
/// 5:created_at, 6:updated_at
fn row_to_task(row: &libsql::Row) -> Result<JobTask, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let job_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let task_type: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let task_order: i64 = row
        .get(3)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let status: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let created: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let updated: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    let kind = TaskKind::parse(&task_type).ok_or_else(|| {
        DatabaseError::Serialization(format!("Unknown task_type {task_type:?} in row"))
    })?;

    Ok(JobTask {
        id: parse_uuid(&id, "task")?,
        job_id: parse_uuid(&job_id, "job")?,
        kind,
        task_order,
        status: str_to_task_status(&status),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql row to a VersionRecord.
///
/// Column order: 0:id, 1:task_id, 2:result, 3:created_at
fn row_to_version(row: &libsql::Row) -> Result<VersionRecord, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let task_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let result: Option<String> = row.get(2).ok();
    let created: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(VersionRecord {
        id,
        task_id: parse_uuid(&task_id, "task")?,
        result: parse_json(result)?,
        created_at: parse_datetime(&created),
    })
}

const TASK_COLUMNS: &str = "id, job_id, task_type, task_order, status, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs & tasks ────────────────────────────────────────────────

    async fn insert_job_with_tasks(
        &self,
        job: &Job,
        tasks: &[JobTask],
    ) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(&job.data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self.begin().await?;
        tx.execute(
            "INSERT INTO jobs (id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id.to_string(),
                job.status.as_str(),
                data,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to insert job: {e}")))?;

        for task in tasks {
            tx.execute(
                "INSERT INTO job_tasks (id, job_id, task_type, task_order, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.to_string(),
                    task.job_id.to_string(),
                    task.kind.as_str(),
                    task.task_order,
                    task.status.as_str(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert task: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Job insert commit failed: {e}")))?;
        debug!(job_id = %job.id, tasks = tasks.len(), "Job inserted with tasks");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, status, data, created_at, updated_at FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_job_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update job status: {e}")))?;
        debug!(job_id = %id, status = status.as_str(), "Job status updated");
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        let tx = self.begin().await?;
        tx.execute(
            "DELETE FROM job_tasks WHERE job_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to delete job tasks: {e}")))?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to delete job: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Job delete commit failed: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<JobTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM job_tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks_for_job(&self, job_id: Uuid) -> Result<Vec<JobTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks WHERE job_id = ?1 ORDER BY task_order"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn task_by_order(
        &self,
        job_id: Uuid,
        task_order: i64,
    ) -> Result<Option<JobTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks WHERE job_id = ?1 AND task_order = ?2"
                ),
                params![job_id.to_string(), task_order],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn next_pending_task(&self) -> Result<Option<JobTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE status = 'pending'
                     ORDER BY created_at ASC, task_order ASC
                     LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update task status: {e}")))?;
        debug!(task_id = %id, status = status.as_str(), "Task status updated");
        Ok(())
    }

    async fn count_unfinished_tasks(&self, job_id: Uuid) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM job_tasks WHERE job_id = ?1 AND status != 'completed'",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match row {
            Some(row) => row.get(0).map_err(|e| DatabaseError::Query(e.to_string())),
            None => Ok(0),
        }
    }

    // ── Task versions ───────────────────────────────────────────────

    async fn insert_version(&self, task_id: Uuid, result: &Value) -> Result<i64, DatabaseError> {
        let result_str = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self.begin().await?;
        tx.execute(
            "INSERT INTO task_versions (task_id, result, created_at) VALUES (?1, ?2, ?3)",
            params![
                task_id.to_string(),
                result_str.clone(),
                Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to insert version: {e}")))?;

        let version_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT OR REPLACE INTO current_task_versions (task_id, version_id, result)
             VALUES (?1, ?2, ?3)",
            params![task_id.to_string(), version_id, result_str],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to update version pointer: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Version commit failed: {e}")))?;
        Ok(version_id)
    }

    async fn complete_task(&self, task_id: Uuid, result: &Value) -> Result<i64, DatabaseError> {
        let result_str = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let tx = self.begin().await?;
        tx.execute(
            "INSERT INTO task_versions (task_id, result, created_at) VALUES (?1, ?2, ?3)",
            params![task_id.to_string(), result_str.clone(), now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to insert version: {e}")))?;

        let version_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT OR REPLACE INTO current_task_versions (task_id, version_id, result)
             VALUES (?1, ?2, ?3)",
            params![task_id.to_string(), version_id, result_str],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to update version pointer: {e}")))?;

        tx.execute(
            "UPDATE job_tasks SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now, task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to mark task completed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Completion commit failed: {e}")))?;
        Ok(version_id)
    }

    async fn current_version(
        &self,
        task_id: Uuid,
    ) -> Result<Option<VersionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tv.id, tv.task_id, tv.result, tv.created_at
                 FROM task_versions tv
                 JOIN current_task_versions ctv ON tv.id = ctv.version_id
                 WHERE ctv.task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_version(&row)?)),
            None => Ok(None),
        }
    }

    async fn version(
        &self,
        task_id: Uuid,
        version_id: i64,
    ) -> Result<Option<VersionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, result, created_at
                 FROM task_versions
                 WHERE id = ?1 AND task_id = ?2",
                params![version_id, task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_version(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_versions(&self, task_id: Uuid) -> Result<Vec<VersionMeta>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, created_at FROM task_versions WHERE task_id = ?1 ORDER BY id",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut versions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            let id: i64 = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
            let created: String = row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?;
            versions.push(VersionMeta {
                id,
                created_at: parse_datetime(&created),
            });
        }
        Ok(versions)
    }

    // ── Keyword search cache ────────────────────────────────────────

    async fn cached_keyword_search(
        &self,
        keyword: &str,
        location: &str,
    ) -> Result<Option<Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT response_json FROM similar_keyword_searches
                 WHERE keyword = ?1 AND location = ?2",
                params![keyword, location],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let raw: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(parse_json(Some(raw))?))
            }
            None => Ok(None),
        }
    }

    async fn cache_keyword_search(
        &self,
        keyword: &str,
        location: &str,
        response: &Value,
    ) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(response)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO similar_keyword_searches (keyword, location, response_json)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (keyword, location) DO UPDATE SET
                     response_json = excluded.response_json,
                     updated_at = datetime('now'),
                     search_count = search_count + 1",
                params![keyword, location, raw],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to cache keyword search: {e}")))?;
        Ok(())
    }
}

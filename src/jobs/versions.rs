//! VersionStore — append-only history of task results.
//!
//! Every (re)run of a task appends a new immutable version; the
//! current-version pointer decides which one downstream reads see. "Latest"
//! always means the pointer target here, never the highest id — ad-hoc
//! history queries go through `list_versions`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{FieldChange, VersionMeta, VersionRecord, diff_results};
use crate::store::Database;

/// Typed front over the database for task versions.
#[derive(Clone)]
pub struct VersionStore {
    db: Arc<dyn Database>,
}

impl VersionStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append an immutable version and move the current-version pointer to
    /// it. Both writes commit together or not at all.
    pub async fn create_version(
        &self,
        task_id: Uuid,
        result: &Value,
    ) -> Result<i64, DatabaseError> {
        let version_id = self.db.insert_version(task_id, result).await?;
        debug!(task_id = %task_id, version_id, "Version created");
        Ok(version_id)
    }

    /// Append a version, move the pointer, and mark the owning task
    /// `completed`, in a single transaction. Returns the new version id.
    pub async fn record_completion(
        &self,
        task_id: Uuid,
        result: &Value,
    ) -> Result<i64, DatabaseError> {
        let version_id = self.db.complete_task(task_id, result).await?;
        debug!(task_id = %task_id, version_id, "Completion recorded");
        Ok(version_id)
    }

    /// Fetch a version of a task's result.
    ///
    /// With `version_id = None` this resolves through the current-version
    /// pointer.
    pub async fn get_version(
        &self,
        task_id: Uuid,
        version_id: Option<i64>,
    ) -> Result<Option<VersionRecord>, DatabaseError> {
        match version_id {
            None => self.db.current_version(task_id).await,
            Some(id) => self.db.version(task_id, id).await,
        }
    }

    /// Version history for a task, oldest first.
    pub async fn list_versions(&self, task_id: Uuid) -> Result<Vec<VersionMeta>, DatabaseError> {
        self.db.list_versions(task_id).await
    }

    /// Key-level diff between two stored versions of a task's result.
    pub async fn compare_versions(
        &self,
        task_id: Uuid,
        version_a: i64,
        version_b: i64,
    ) -> Result<BTreeMap<String, FieldChange>, DatabaseError> {
        let a = self
            .db
            .version(task_id, version_a)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task_version".to_string(),
                id: version_a.to_string(),
            })?;
        let b = self
            .db
            .version(task_id, version_b)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task_version".to_string(),
                id: version_b.to_string(),
            })?;

        Ok(diff_results(&a.result, &b.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{Job, JobStatus, JobTask, TaskStatus};
    use crate::registry::TaskKind;
    use crate::store::LibSqlBackend;
    use chrono::Utc;
    use serde_json::json;

    async fn seeded_store() -> (VersionStore, Uuid) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            data: json!({}),
            created_at: now,
            updated_at: now,
        };
        let task = JobTask {
            id: Uuid::new_v4(),
            job_id: job.id,
            kind: TaskKind::NormalizeInput,
            task_order: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        db.insert_job_with_tasks(&job, std::slice::from_ref(&task))
            .await
            .unwrap();
        (VersionStore::new(db), task.id)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (store, task_id) = seeded_store().await;
        let payload = json!({"nested": {"list": [1, 2, 3]}, "s": "text"});

        store.create_version(task_id, &payload).await.unwrap();
        let fetched = store.get_version(task_id, None).await.unwrap().unwrap();
        assert_eq!(fetched.result, payload);

        // Reads are idempotent with no intervening write.
        let again = store.get_version(task_id, None).await.unwrap().unwrap();
        assert_eq!(again.id, fetched.id);
        assert_eq!(again.result, fetched.result);
    }

    #[tokio::test]
    async fn missing_version_is_none_not_error() {
        let (store, task_id) = seeded_store().await;
        assert!(store.get_version(task_id, None).await.unwrap().is_none());
        assert!(store.get_version(task_id, Some(42)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compare_versions_reports_key_changes() {
        let (store, task_id) = seeded_store().await;
        let v1 = store
            .create_version(task_id, &json!({"kept": 1, "gone": true}))
            .await
            .unwrap();
        let v2 = store
            .create_version(task_id, &json!({"kept": 2, "added": "x"}))
            .await
            .unwrap();

        let diff = store.compare_versions(task_id, v1, v2).await.unwrap();
        assert_eq!(
            diff.keys().cloned().collect::<Vec<_>>(),
            vec!["added", "gone", "kept"]
        );
        assert_eq!(diff["kept"].old, Some(json!(1)));
        assert_eq!(diff["kept"].new, Some(json!(2)));
        assert_eq!(diff["gone"].new, None);
        assert_eq!(diff["added"].old, None);
    }

    #[tokio::test]
    async fn compare_with_missing_version_fails() {
        let (store, task_id) = seeded_store().await;
        let v1 = store.create_version(task_id, &json!({})).await.unwrap();
        let err = store.compare_versions(task_id, v1, 999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}

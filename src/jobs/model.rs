//! Persistent records for jobs, tasks, and task versions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::registry::TaskKind;

/// Lifecycle of a job.
///
/// There is no failure status: a job with a failed task stays `pending`
/// until a manual re-run lets it finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
        }
    }
}

/// Lifecycle of a single pipeline task.
///
/// `Blocked` is the provisioning state for every task after the first; the
/// scheduler promotes it to `Pending` only once the preceding task has
/// completed, so eligibility lives entirely in this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Blocked,
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// A unit of work: one submission driving a fixed pipeline of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// The submission payload, stored verbatim.
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stage of a job's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: TaskKind,
    /// 0-based position in the job's pipeline.
    pub task_order: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot of a task's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

/// Listing entry for a task's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// One side-aware difference between two versions of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Key-level diff of two result payloads.
///
/// Works over the union of top-level keys; a key missing on one side shows up
/// as a one-sided change. Payloads that are not JSON objects are compared
/// whole under the synthetic key `"$"`. The `BTreeMap` keeps the output
/// deterministic regardless of payload key order.
pub fn diff_results(old: &Value, new: &Value) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();

    let (Some(old_map), Some(new_map)) = (old.as_object(), new.as_object()) else {
        if old != new {
            changes.insert(
                "$".to_string(),
                FieldChange {
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                },
            );
        }
        return changes;
    };

    for key in old_map.keys().chain(new_map.keys()) {
        if changes.contains_key(key) {
            continue;
        }
        match (old_map.get(key), new_map.get(key)) {
            (Some(a), Some(b)) if a == b => {}
            (a, b) => {
                changes.insert(
                    key.clone(),
                    FieldChange {
                        old: a.cloned(),
                        new: b.cloned(),
                    },
                );
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_reports_one_sided_and_changed_keys() {
        let old = json!({"a": 1, "b": "x", "same": true});
        let new = json!({"b": "y", "c": [1, 2], "same": true});

        let diff = diff_results(&old, &new);
        let keys: Vec<_> = diff.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        assert_eq!(diff["a"], FieldChange { old: Some(json!(1)), new: None });
        assert_eq!(
            diff["b"],
            FieldChange { old: Some(json!("x")), new: Some(json!("y")) }
        );
        assert_eq!(diff["c"], FieldChange { old: None, new: Some(json!([1, 2])) });
    }

    #[test]
    fn diff_of_equal_payloads_is_empty() {
        let v = json!({"a": {"nested": [1, 2, 3]}});
        assert!(diff_results(&v, &v).is_empty());
    }

    #[test]
    fn non_object_payloads_diff_under_synthetic_key() {
        let diff = diff_results(&json!("before"), &json!("after"));
        assert_eq!(diff.len(), 1);
        assert_eq!(
            diff["$"],
            FieldChange {
                old: Some(json!("before")),
                new: Some(json!("after")),
            }
        );
    }
}

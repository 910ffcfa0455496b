//! End-to-end scheduler scenarios against an in-memory database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use pageforge::config::SchedulerConfig;
use pageforge::engine::{HandlerContext, HandlerSet, Scheduler, TaskHandler};
use pageforge::error::{ProviderError, TaskError};
use pageforge::jobs::model::{JobStatus, TaskStatus};
use pageforge::jobs::{JobStore, VersionStore};
use pageforge::pipeline::standard_handlers;
use pageforge::providers::{
    CompletionProvider, EmbeddingService, KeywordMetrics, KeywordProvider,
};
use pageforge::registry::{TaskKind, TaskRegistry};
use pageforge::store::{Database, LibSqlBackend};

// ── Mock collaborators ──────────────────────────────────────────────

struct MockCompletion;

#[async_trait]
impl CompletionProvider for MockCompletion {
    async fn generate_text(&self, _prompt: &str, _max_tokens: u32) -> Result<String, ProviderError> {
        Ok("```html\n<html><body>Acme Bins</body></html>\n```".to_string())
    }

    fn model_name(&self) -> &str {
        "mock-completion"
    }
}

struct MockKeywords;

#[async_trait]
impl KeywordProvider for MockKeywords {
    async fn similar_keywords(
        &self,
        term: &str,
        _location: &str,
    ) -> Result<BTreeMap<String, KeywordMetrics>, ProviderError> {
        let mut out = BTreeMap::new();
        out.insert(
            format!("{term} near me"),
            KeywordMetrics {
                search_volume: Some(90),
                cpc: Some(1.2),
                competition: Some(0.4),
            },
        );
        out.insert(format!("{term} prices"), KeywordMetrics::default());
        Ok(out)
    }
}

/// Every text maps to the same direction, so all similarities are 1.0.
struct MockEmbeddings;

#[async_trait]
impl EmbeddingService for MockEmbeddings {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![1.0, 0.0])
    }
}

// ── Flaky handler for retry scenarios ───────────────────────────────

struct Flaky {
    kind: TaskKind,
    remaining_failures: AtomicU32,
}

impl Flaky {
    fn failing(kind: TaskKind, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            remaining_failures: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl TaskHandler for Flaky {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn run(&self, _ctx: &HandlerContext) -> Result<Value, TaskError> {
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskError::Provider(ProviderError::Overloaded {
                provider: "mock".to_string(),
            }));
        }
        Ok(json!({"attempted": true}))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    db: Arc<dyn Database>,
    jobs: JobStore,
    versions: VersionStore,
    scheduler: Scheduler,
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        retry_attempts: 3,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
    }
}

async fn harness(handlers: HandlerSet) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let registry = Arc::new(TaskRegistry::standard());
    let jobs = JobStore::new(Arc::clone(&db), Arc::clone(&registry));
    let versions = VersionStore::new(Arc::clone(&db));
    let scheduler = Scheduler::new(
        jobs.clone(),
        versions.clone(),
        registry,
        Arc::new(handlers),
        fast_config(),
    );
    Harness {
        db,
        jobs,
        versions,
        scheduler,
    }
}

async fn pipeline_harness() -> Harness {
    harness(standard_handlers(
        Arc::new(MockCompletion),
        Arc::new(MockKeywords),
        Arc::new(MockEmbeddings),
        512,
    ))
    .await
}

fn submission() -> Value {
    json!({
        "pageType": "service",
        "companyName": "Acme Bins",
        "companyUrl": "https://acmebins.example",
        "companyDescription": "Bin rental for contractors",
        "seedKeywords": ["bin rental", "dumpster hire"],
        "locations": ["CA"],
        "pageUrl": "https://acmebins.example/bin-rental",
        "pageTitle": "Bin Rental",
        "pageInfo": "Same-day delivery",
        "pageUsp": "Cheapest in town",
        "isNewPage": true,
    })
}

// ── Provisioning ────────────────────────────────────────────────────

#[tokio::test]
async fn job_creation_provisions_exactly_the_registry() {
    let h = pipeline_harness().await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    assert_eq!(tasks.len(), 6);

    let registry = TaskRegistry::standard();
    for (i, (task, kind)) in tasks.iter().zip(registry.kinds()).enumerate() {
        assert_eq!(task.task_order, i as i64);
        assert_eq!(task.kind, kind);
    }

    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert!(tasks[1..].iter().all(|t| t.status == TaskStatus::Blocked));
}

// ── Retries exhausted ───────────────────────────────────────────────

#[tokio::test]
async fn three_transient_failures_fail_the_task_and_block_downstream() {
    let handlers = HandlerSet::new().with(Flaky::failing(TaskKind::NormalizeInput, u32::MAX));
    let h = harness(handlers).await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    assert!(h.scheduler.step().await.unwrap());

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    // Task 1 never transitions to pending.
    assert_eq!(tasks[1].status, TaskStatus::Blocked);

    // No version was ever written for the failed task.
    assert!(h.versions.list_versions(tasks[0].id).await.unwrap().is_empty());

    // The loop finds nothing further to do, and the job stays pending.
    assert!(!h.scheduler.step().await.unwrap());
    let job = h.jobs.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

// ── Success within the retry budget ─────────────────────────────────

#[tokio::test]
async fn success_on_second_attempt_completes_and_unlocks() {
    let handlers = HandlerSet::new().with(Flaky::failing(TaskKind::NormalizeInput, 1));
    let h = harness(handlers).await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    assert!(h.scheduler.step().await.unwrap());

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[1].status, TaskStatus::Pending);

    let history = h.versions.list_versions(tasks[0].id).await.unwrap();
    assert_eq!(history.len(), 1);
    let current = h.versions.get_version(tasks[0].id, None).await.unwrap().unwrap();
    assert_eq!(current.result, json!({"attempted": true}));
}

// ── Full pipeline run ───────────────────────────────────────────────

#[tokio::test]
async fn full_pipeline_completes_job_after_sixth_task() {
    let h = pipeline_harness().await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    for expected_done in 1..=5 {
        assert!(h.scheduler.step().await.unwrap());
        let job = h.jobs.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(
            job.status,
            JobStatus::Pending,
            "job must stay pending after {expected_done} tasks"
        );
    }

    assert!(h.scheduler.step().await.unwrap());
    let job = h.jobs.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // Nothing pending remains.
    assert!(!h.scheduler.step().await.unwrap());

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    // No task is completed with zero versions, and every pointer resolves
    // to a real version in that task's history.
    for task in &tasks {
        let history = h.versions.list_versions(task.id).await.unwrap();
        assert!(!history.is_empty());
        let current = h.versions.get_version(task.id, None).await.unwrap().unwrap();
        assert!(history.iter().any(|v| v.id == current.id));
    }

    // The rendered output made it through fence-stripping.
    let render_task = tasks.iter().find(|t| t.kind == TaskKind::RenderPage).unwrap();
    let rendered = h
        .versions
        .get_version(render_task.id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        rendered.result["generated_html"],
        json!("<html><body>Acme Bins</body></html>")
    );

    // Intermediate stages carried the expected shapes.
    let expand_task = tasks
        .iter()
        .find(|t| t.kind == TaskKind::ExpandKeywords)
        .unwrap();
    let expanded = h
        .versions
        .get_version(expand_task.id, None)
        .await
        .unwrap()
        .unwrap();
    let full_list = expanded.result["full_kw_list"].as_array().unwrap();
    assert_eq!(full_list.len(), 4);
}

// ── Manual re-run ───────────────────────────────────────────────────

#[tokio::test]
async fn rerun_appends_a_version_without_rewriting_history() {
    let h = pipeline_harness().await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    while h.scheduler.step().await.unwrap() {}

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    let render_task = tasks.iter().find(|t| t.kind == TaskKind::RenderPage).unwrap();

    let before = h.versions.list_versions(render_task.id).await.unwrap();
    assert_eq!(before.len(), 1);
    let first_id = before[0].id;

    let new_id = h.scheduler.rerun_task(render_task.id).await.unwrap();
    assert!(new_id > first_id);

    let after = h.versions.list_versions(render_task.id).await.unwrap();
    let ids: Vec<i64> = after.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![first_id, new_id]);

    // The pointer moved; the old version is still readable by id.
    let current = h
        .versions
        .get_version(render_task.id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.id, new_id);
    assert!(
        h.versions
            .get_version(render_task.id, Some(first_id))
            .await
            .unwrap()
            .is_some()
    );

    let task = h.jobs.task(render_task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

// ── Ordering across jobs ────────────────────────────────────────────

#[tokio::test]
async fn earlier_jobs_tasks_are_serviced_first() {
    let h = pipeline_harness().await;
    let job_a = h.jobs.create_job(submission()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let job_b = h.jobs.create_job(submission()).await.unwrap();

    // All of A's tasks were created before any of B's, so A drains fully
    // before B's first task runs.
    for _ in 0..6 {
        assert!(h.scheduler.step().await.unwrap());
    }

    let a = h.jobs.get_job(job_a).await.unwrap().unwrap();
    assert_eq!(a.status, JobStatus::Completed);

    let b_tasks = h.jobs.tasks_for(job_b).await.unwrap();
    assert_eq!(b_tasks[0].status, TaskStatus::Pending);
    assert!(b_tasks[1..].iter().all(|t| t.status == TaskStatus::Blocked));

    for _ in 0..6 {
        assert!(h.scheduler.step().await.unwrap());
    }
    let b = h.jobs.get_job(job_b).await.unwrap().unwrap();
    assert_eq!(b.status, JobStatus::Completed);
}

// ── Rollback forensics ──────────────────────────────────────────────

#[tokio::test]
async fn rollback_keeps_versions_for_forensics() {
    let h = pipeline_harness().await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    assert!(h.scheduler.step().await.unwrap());
    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    let normalized_task_id = tasks[0].id;
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    h.jobs.rollback_job(job_id).await.unwrap();
    assert!(h.jobs.get_job(job_id).await.unwrap().is_none());
    assert!(h.db.get_task(normalized_task_id).await.unwrap().is_none());

    // The orphaned version survives the rollback.
    let history = h.versions.list_versions(normalized_task_id).await.unwrap();
    assert_eq!(history.len(), 1);
}

// ── Unknown task type is fatal, not retried ─────────────────────────

#[tokio::test]
async fn missing_handler_fails_the_task_immediately() {
    // Empty handler set: every lookup is an unknown-type dispatch miss.
    let h = harness(HandlerSet::new()).await;
    let job_id = h.jobs.create_job(submission()).await.unwrap();

    assert!(h.scheduler.step().await.unwrap());

    let tasks = h.jobs.tasks_for(job_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[1].status, TaskStatus::Blocked);
}

//! Task type registry — the catalog of pipeline stages.
//!
//! The registry doubles as the pipeline definition: jobs are provisioned with
//! one task per entry, in entry order. The engine treats the ordering as data,
//! so pipelines of other shapes can be registered without touching the
//! scheduler.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::TaskError;

/// The registered kinds of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    NormalizeInput,
    ExpandKeywords,
    SelectKeywords,
    ClusterKeywords,
    SelectCluster,
    RenderPage,
}

impl TaskKind {
    /// Canonical wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::NormalizeInput => "normalize_input",
            TaskKind::ExpandKeywords => "expand_keywords",
            TaskKind::SelectKeywords => "select_keywords",
            TaskKind::ClusterKeywords => "cluster_keywords",
            TaskKind::SelectCluster => "select_cluster",
            TaskKind::RenderPage => "render_page",
        }
    }

    /// Parse a storage name back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normalize_input" => Some(TaskKind::NormalizeInput),
            "expand_keywords" => Some(TaskKind::ExpandKeywords),
            "select_keywords" => Some(TaskKind::SelectKeywords),
            "cluster_keywords" => Some(TaskKind::ClusterKeywords),
            "select_cluster" => Some(TaskKind::SelectCluster),
            "render_page" => Some(TaskKind::RenderPage),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one task type.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub description: &'static str,
    /// JSON-Schema fragment for the handler's expected inputs.
    pub input_schema: Value,
    /// JSON-Schema fragment for the handler's result.
    pub output_schema: Value,
    /// Whether re-running with the same inputs is expected to reproduce the
    /// same output. Informational only; the engine does not enforce it.
    pub deterministic: bool,
}

/// Ordered catalog of task types; also the pipeline used to provision jobs.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    specs: Vec<TaskSpec>,
}

impl TaskRegistry {
    /// Build a registry from an explicit ordered list of specs.
    pub fn new(specs: Vec<TaskSpec>) -> Self {
        Self { specs }
    }

    /// The six-stage content-generation pipeline.
    pub fn standard() -> Self {
        fn string_list() -> Value {
            json!({"type": "array", "items": {"type": "string"}})
        }
        Self::new(vec![
            TaskSpec {
                kind: TaskKind::NormalizeInput,
                description: "Process and validate the initial submission",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "companyName": {"type": "string"},
                        "companyDescription": {"type": "string"},
                        "companyUrl": {"type": "string"},
                        "locations": string_list(),
                        "seedKeywords": string_list(),
                    },
                    "required": ["companyName", "companyDescription", "companyUrl", "locations"],
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "company_string": {"type": "string"},
                        "page_string": {"type": "string"},
                        "locations": string_list(),
                        "seed_keywords": string_list(),
                        "page_type": {"type": "string"},
                    },
                }),
                deterministic: true,
            },
            TaskSpec {
                kind: TaskKind::ExpandKeywords,
                description: "Expand seed keywords into candidates per location",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "locations": string_list(),
                        "seed_keywords": string_list(),
                    },
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "similar_kw_dict": {"type": "object"},
                        "full_kw_list": string_list(),
                    },
                }),
                deterministic: false,
            },
            TaskSpec {
                kind: TaskKind::SelectKeywords,
                description: "Select the best candidates by similarity to the seeds",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "full_kw_list": string_list(),
                        "seed_keywords": string_list(),
                    },
                }),
                output_schema: json!({
                    "type": "object",
                    "additionalProperties": string_list(),
                }),
                deterministic: true,
            },
            TaskSpec {
                kind: TaskKind::ClusterKeywords,
                description: "Cluster candidate keywords into groups",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "full_kw_list": string_list(),
                        "seed_keywords": string_list(),
                    },
                }),
                output_schema: json!({
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "cluster_id": {"type": "integer"},
                            "keywords": string_list(),
                        },
                    },
                }),
                deterministic: true,
            },
            TaskSpec {
                kind: TaskKind::SelectCluster,
                description: "Select the cluster most relevant to the page",
                input_schema: json!({
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "cluster_id": {"type": "integer"},
                            "keywords": string_list(),
                        },
                    },
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "best_cluster": {
                            "type": "object",
                            "properties": {
                                "cluster_id": {"type": "integer"},
                                "keywords": string_list(),
                            },
                        },
                    },
                }),
                deterministic: true,
            },
            TaskSpec {
                kind: TaskKind::RenderPage,
                description: "Render the final page content from the selected keywords",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "best_cluster": {"type": "object"},
                        "company_string": {"type": "string"},
                        "page_string": {"type": "string"},
                    },
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {"generated_html": {"type": "string"}},
                }),
                deterministic: false,
            },
        ])
    }

    /// Whether `name` is a registered task type.
    pub fn validate(&self, name: &str) -> bool {
        TaskKind::parse(name).is_some_and(|k| self.specs.iter().any(|s| s.kind == k))
    }

    /// Look up the spec for a task type by name.
    pub fn spec_of(&self, name: &str) -> Result<&TaskSpec, TaskError> {
        TaskKind::parse(name)
            .and_then(|k| self.specs.iter().find(|s| s.kind == k))
            .ok_or_else(|| TaskError::UnknownType(name.to_string()))
    }

    /// Registered kinds, in pipeline order.
    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.specs.iter().map(|s| s.kind)
    }

    /// The terminal stage of the pipeline.
    pub fn terminal(&self) -> Option<TaskKind> {
        self.specs.last().map(|s| s.kind)
    }

    /// Number of pipeline stages.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

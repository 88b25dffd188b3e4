use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
}

/// Leaf job: runs a registered implementation against zero or more targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceSpec {
    /// Registry key of the `Executable` that does the work.
    pub implementation: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub target_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Success,
    Failure,
    Prerequisite,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeKind::Success => "success",
            EdgeKind::Failure => "failure",
            EdgeKind::Prerequisite => "prerequisite",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkflowEdge {
    pub source: JobId,
    pub destination: JobId,
    pub subtype: EdgeKind,
}

/// Composite job. `start` and `end` are always members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowSpec {
    pub members: Vec<JobId>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    pub start: JobId,
    pub end: JobId,
}

impl WorkflowSpec {
    pub fn contains(&self, id: JobId) -> bool {
        self.members.contains(&id)
    }

    pub fn outgoing(&self, source: JobId, subtype: EdgeKind) -> impl Iterator<Item = JobId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.source == source && e.subtype == subtype)
            .map(|e| e.destination)
    }

    pub fn prerequisites(&self, destination: JobId) -> impl Iterator<Item = JobId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.destination == destination && e.subtype == EdgeKind::Prerequisite)
            .map(|e| e.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Service(ServiceSpec),
    Workflow(WorkflowSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    #[serde(default)]
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: JobKind,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_seconds: u64,
    /// Pause after this job finishes when it runs as a workflow member.
    #[serde(default)]
    pub waiting_time_seconds: u64,
    #[serde(default)]
    pub concurrency_enabled: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub send_notification: bool,
    /// Name of the job invoked with the run summary.
    #[serde(default)]
    pub notification_method: Option<String>,
}

fn default_max_concurrency() -> usize { 5 }

impl Job {
    pub fn service(name: &str, implementation: &str) -> Self {
        Self::new(
            name,
            JobKind::Service(ServiceSpec {
                implementation: implementation.to_string(),
                ..Default::default()
            }),
        )
    }

    pub fn new(name: &str, kind: JobKind) -> Self {
        Self {
            id: JobId::default(),
            name: name.to_string(),
            description: String::new(),
            kind,
            retry_count: 0,
            retry_delay_seconds: 0,
            waiting_time_seconds: 0,
            concurrency_enabled: false,
            max_concurrency: default_max_concurrency(),
            status: JobStatus::Idle,
            send_notification: false,
            notification_method: None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceSpec> {
        match &self.kind {
            JobKind::Service(spec) => Some(spec),
            JobKind::Workflow(_) => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&WorkflowSpec> {
        match &self.kind {
            JobKind::Workflow(spec) => Some(spec),
            JobKind::Service(_) => None,
        }
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, JobKind::Workflow(_))
    }
}

/// A remote endpoint a service executes against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Target {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
}

impl Outcome {
    pub fn success(result: impl Into<Value>) -> Self {
        Self { success: true, result: result.into() }
    }

    pub fn failure(result: impl Into<Value>) -> Self {
        Self { success: false, result: result.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scope", content = "outcome", rename_all = "snake_case")]
pub enum RunResults {
    Single(Outcome),
    PerTarget(BTreeMap<String, Outcome>),
}

impl RunResults {
    pub fn success(&self) -> bool {
        match self {
            RunResults::Single(outcome) => outcome.success,
            RunResults::PerTarget(map) => map.values().all(|o| o.success),
        }
    }
}

/// Immutable record of one `try_run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub runtime: String,
    pub job_id: JobId,
    pub job_name: String,
    pub success: bool,
    pub results: RunResults,
    pub attempts: u32,
    #[serde(default)]
    pub logs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Run {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Job: {}\nRuntime: {}\nStatus: {}\nAttempts: {}\n",
            self.job_name,
            self.runtime,
            if self.success { "PASS" } else { "FAILED" },
            self.attempts
        );
        if let RunResults::PerTarget(map) = &self.results {
            let failed: Vec<&str> = map
                .iter()
                .filter(|(_, o)| !o.success)
                .map(|(name, _)| name.as_str())
                .collect();
            text.push_str(&format!("Targets: {} ({} failed)\n", map.len(), failed.len()));
            if !failed.is_empty() {
                text.push_str(&format!("Failed targets: {}\n", failed.join(", ")));
            }
        }
        text
    }
}

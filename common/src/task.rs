use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
}

/// Binds one job to a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default)]
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub job_id: JobId,
    pub trigger: Trigger,
    /// Scheduler entry id. Assigned once at creation.
    pub external_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    /// The trigger with the task's start/end dates folded in.
    pub fn effective_trigger(&self) -> Trigger {
        self.trigger.clone().bounded(self.start_date, self.end_date)
    }
}

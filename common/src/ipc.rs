use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::trigger::Trigger;

/// What a scheduled entry runs when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunArgs {
    pub job_id: JobId,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub payload: Value,
}

impl RunArgs {
    pub fn job(job_id: JobId) -> Self {
        Self { job_id, targets: None, payload: Value::Null }
    }
}

/// Scheduler-side state of one entry. `next_run_time == None` means paused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub id: String,
    pub trigger: Trigger,
    pub args: RunArgs,
    #[serde(default)]
    pub next_run_time: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn is_paused(&self) -> bool {
        self.next_run_time.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobRequest {
    pub id: String,
    pub trigger: Trigger,
    pub args: RunArgs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobChanges {
    #[serde(default)]
    pub args: Option<RunArgs>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub jobs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub mod ipc;
pub mod job;
pub mod task;
pub mod trigger;

pub use ipc::{AddJobRequest, ErrorBody, JobChanges, RunArgs, ScheduledJob, SchedulerState, SchedulerStatus};
pub use job::{EdgeKind, Job, JobId, JobKind, JobStatus, Outcome, Run, RunResults,
             ServiceSpec, Target, WorkflowEdge, WorkflowSpec};
pub use task::{Task, TaskId, TaskStatus};
pub use trigger::{parse_trigger, CronFields, Trigger};

/// Shared-key header checked by the scheduler wire server.
pub const API_KEY_HEADER: &str = "X-API-Key";

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_DB_PATH: &str = "/var/lib/meshflow/meshflow.db";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/meshflow/config.yaml";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8770";
pub const DEFAULT_PRIMARY_URL: &str = "http://127.0.0.1:8770";

// Fallback for non-root users
pub const USER_DB_PATH: &str = "meshflow.db";

use async_trait::async_trait;
use common::{JobChanges, RunArgs, ScheduledJob, SchedulerStatus, Trigger};
use std::sync::{Arc, Weak};

use crate::error::Result;

pub mod delegating;
pub mod primary;

/// What a fired entry calls back into.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_scheduled(self: Arc<Self>, entry: String, args: RunArgs);
}

/// Scheduling capability shared by the embedded primary and the HTTP proxy.
///
/// Entries move between scheduled and paused until removed. A paused entry
/// has no `next_run_time`.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Hand the scheduler the runner fired entries call. Only meaningful for
    /// schedulers that own timers.
    fn bind(&self, _runner: Weak<dyn JobRunner>) {}

    async fn start(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn status(&self) -> Result<SchedulerStatus>;

    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>>;
    async fn get_jobs(&self) -> Result<Vec<ScheduledJob>>;

    /// Rejects an invalid trigger before anything is registered.
    async fn add_job(&self, id: &str, trigger: Trigger, args: RunArgs) -> Result<ScheduledJob>;
    async fn modify_job(&self, id: &str, changes: JobChanges) -> Result<ScheduledJob>;
    async fn reschedule_job(&self, id: &str, trigger: Trigger) -> Result<ScheduledJob>;
    async fn remove_job(&self, id: &str) -> Result<()>;
    async fn pause_job(&self, id: &str) -> Result<ScheduledJob>;
    /// The next run is computed from the moment of the call.
    async fn resume_job(&self, id: &str) -> Result<ScheduledJob>;
}

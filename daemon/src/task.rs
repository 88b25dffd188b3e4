use chrono::{DateTime, Utc};
use common::{JobChanges, JobId, RunArgs, Task, TaskStatus, Trigger};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::store::{require_job, require_task, Lookup};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub job_id: JobId,
    pub trigger: Trigger,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub payload: Value,
    /// Create without registering a scheduler entry.
    #[serde(default)]
    pub paused: bool,
}

impl NewTask {
    pub fn new(name: &str, job_id: JobId, trigger: Trigger) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            job_id,
            trigger,
            start_date: None,
            end_date: None,
            targets: None,
            payload: Value::Null,
            paused: false,
        }
    }
}

/// Fields left `None` are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskChanges {
    pub description: Option<String>,
    pub trigger: Option<Trigger>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub targets: Option<Vec<String>>,
    pub payload: Option<Value>,
}

fn run_args(task: &Task) -> RunArgs {
    RunArgs {
        job_id: task.job_id,
        targets: task.targets.clone(),
        payload: task.payload.clone(),
    }
}

fn validate(task: &Task) -> Result<Trigger> {
    let trigger = task.effective_trigger();
    trigger
        .validate()
        .map_err(|e| EngineError::InvalidTrigger(format!("{:#}", e)))?;
    Ok(trigger)
}

/// Bind a job to a trigger. An active task is registered with the scheduler
/// under a fresh external id; if that fails nothing is kept.
pub async fn create(ctx: &Context, new: NewTask) -> Result<Task> {
    if ctx.store.fetch_task(Lookup::Name(&new.name))?.is_some() {
        return Err(EngineError::Conflict(format!("a task named '{}' already exists", new.name)));
    }
    require_job(ctx.store.as_ref(), Lookup::Id(new.job_id.0))?;

    let task = Task {
        id: Default::default(),
        name: new.name,
        description: new.description,
        job_id: new.job_id,
        trigger: new.trigger,
        external_id: uuid::Uuid::new_v4().to_string(),
        status: if new.paused { TaskStatus::Paused } else { TaskStatus::Active },
        start_date: new.start_date,
        end_date: new.end_date,
        targets: new.targets,
        payload: new.payload,
    };
    let trigger = validate(&task)?;
    let task = ctx.store.save_task(task)?;

    if task.status == TaskStatus::Active {
        if let Err(e) = ctx.scheduler().add_job(&task.external_id, trigger, run_args(&task)).await {
            if let Err(cleanup) = ctx.store.delete_task(task.id) {
                log::error!("Failed to discard task {}: {}", task.name, cleanup);
            }
            return Err(e);
        }
    }
    log::info!("Created task {} ({}) for job {}", task.name, task.external_id, task.job_id);
    Ok(task)
}

/// Apply changes and propagate them to the scheduler entry, if there is one.
pub async fn update(ctx: &Context, name: &str, changes: TaskChanges) -> Result<Task> {
    let mut task = require_task(ctx.store.as_ref(), Lookup::Name(name))?;
    let reschedule = changes.trigger.is_some() || changes.start_date.is_some() || changes.end_date.is_some();
    let modify = changes.targets.is_some() || changes.payload.is_some();

    if let Some(description) = changes.description {
        task.description = description;
    }
    if let Some(trigger) = changes.trigger {
        task.trigger = trigger;
    }
    if changes.start_date.is_some() {
        task.start_date = changes.start_date;
    }
    if changes.end_date.is_some() {
        task.end_date = changes.end_date;
    }
    if changes.targets.is_some() {
        task.targets = changes.targets;
    }
    if let Some(payload) = changes.payload {
        task.payload = payload;
    }
    let trigger = validate(&task)?;

    let scheduler = ctx.scheduler();
    match scheduler.get_job(&task.external_id).await? {
        Some(_) => {
            if reschedule {
                scheduler.reschedule_job(&task.external_id, trigger).await?;
            }
            if modify {
                let changes = JobChanges { args: Some(run_args(&task)) };
                scheduler.modify_job(&task.external_id, changes).await?;
            }
        }
        None if task.status == TaskStatus::Active => {
            scheduler.add_job(&task.external_id, trigger, run_args(&task)).await?;
        }
        None => {}
    }

    let task = ctx.store.save_task(task)?;
    log::info!("Updated task {}", task.name);
    Ok(task)
}

pub async fn pause(ctx: &Context, name: &str) -> Result<Task> {
    let mut task = require_task(ctx.store.as_ref(), Lookup::Name(name))?;
    match ctx.scheduler().pause_job(&task.external_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            log::info!("Task {} has no scheduler entry to pause", task.name)
        }
        Err(e) => return Err(e),
    }
    task.status = TaskStatus::Paused;
    let task = ctx.store.save_task(task)?;
    log::info!("Paused task {}", task.name);
    Ok(task)
}

/// The next run is computed from now. A missing entry is registered again.
pub async fn resume(ctx: &Context, name: &str) -> Result<Task> {
    let mut task = require_task(ctx.store.as_ref(), Lookup::Name(name))?;
    let scheduler = ctx.scheduler();
    match scheduler.resume_job(&task.external_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            let trigger = validate(&task)?;
            scheduler.add_job(&task.external_id, trigger, run_args(&task)).await?;
        }
        Err(e) => return Err(e),
    }
    task.status = TaskStatus::Active;
    let task = ctx.store.save_task(task)?;
    log::info!("Resumed task {}", task.name);
    Ok(task)
}

pub async fn delete(ctx: &Context, name: &str) -> Result<()> {
    let task = require_task(ctx.store.as_ref(), Lookup::Name(name))?;
    match ctx.scheduler().remove_job(&task.external_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    ctx.store.delete_task(task.id)?;
    log::info!("Deleted task {}", task.name);
    Ok(())
}

/// `None` when the task is paused or will not fire again.
pub async fn next_run_time(ctx: &Context, name: &str) -> Result<Option<DateTime<Utc>>> {
    let task = require_task(ctx.store.as_ref(), Lookup::Name(name))?;
    Ok(ctx
        .scheduler()
        .get_job(&task.external_id)
        .await?
        .and_then(|entry| entry.next_run_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use common::Job;
    use std::sync::Arc;

    fn every(seconds: u64) -> Trigger {
        Trigger::Interval { seconds, start: None, end: None, jitter: None }
    }

    fn setup() -> (Arc<Context>, JobId) {
        let ctx = Context::builder(Arc::new(MemoryStore::new())).build();
        let job = ctx.define_job(Job::service("backup", "noop")).unwrap();
        (ctx, job.id)
    }

    #[tokio::test]
    async fn test_create_registers_entry() {
        let (ctx, job) = setup();
        let mut new = NewTask::new("nightly", job, every(3600));
        new.payload = serde_json::json!({"full": true});
        let task = create(&ctx, new).await.unwrap();

        uuid::Uuid::parse_str(&task.external_id).unwrap();
        let entry = ctx.scheduler().get_job(&task.external_id).await.unwrap().unwrap();
        assert_eq!(entry.args.job_id, job);
        assert_eq!(entry.args.payload["full"], true);
        assert!(next_run_time(&ctx, "nightly").await.unwrap().is_some());

        let err = create(&ctx, NewTask::new("nightly", job, every(60))).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let (ctx, job) = setup();
        let err = create(&ctx, NewTask::new("zero", job, every(0))).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        let err = create(&ctx, NewTask::new("orphan", JobId(999), every(60))).await.unwrap_err();
        assert!(err.is_not_found());

        // Valid on its own, but over before it could ever fire.
        let mut expired = NewTask::new("expired", job, every(60));
        expired.end_date = Some(Utc::now() - Duration::hours(1));
        let err = create(&ctx, expired).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        assert!(ctx.store.fetch_tasks().unwrap().is_empty());
        assert!(ctx.scheduler().get_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_then_resume_moves_next_run_forward() {
        let (ctx, job) = setup();
        create(&ctx, NewTask::new("poll", job, every(1))).await.unwrap();
        let before = next_run_time(&ctx, "poll").await.unwrap().unwrap();

        let task = pause(&ctx, "poll").await.unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(next_run_time(&ctx, "poll").await.unwrap(), None);

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        let resumed_at = Utc::now();
        let task = resume(&ctx, "poll").await.unwrap();
        assert_eq!(task.status, TaskStatus::Active);

        let next = next_run_time(&ctx, "poll").await.unwrap().unwrap();
        assert!(next > resumed_at);
        assert!(next > before);
    }

    #[tokio::test]
    async fn test_paused_creation_registers_on_resume() {
        let (ctx, job) = setup();
        let mut new = NewTask::new("later", job, every(60));
        new.paused = true;
        let task = create(&ctx, new).await.unwrap();
        assert!(ctx.scheduler().get_job(&task.external_id).await.unwrap().is_none());

        resume(&ctx, "later").await.unwrap();
        assert!(ctx.scheduler().get_job(&task.external_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_keeps_external_id() {
        let (ctx, job) = setup();
        let created = create(&ctx, NewTask::new("poll", job, every(60))).await.unwrap();

        let changes = TaskChanges {
            trigger: Some(every(300)),
            targets: Some(vec!["edge-1".to_string()]),
            ..Default::default()
        };
        let updated = update(&ctx, "poll", changes).await.unwrap();
        assert_eq!(updated.external_id, created.external_id);

        let entry = ctx.scheduler().get_job(&created.external_id).await.unwrap().unwrap();
        assert_eq!(entry.trigger, every(300));
        assert_eq!(entry.args.targets, Some(vec!["edge-1".to_string()]));
        assert_eq!(ctx.scheduler().get_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_dates_bound_the_entry() {
        let (ctx, job) = setup();
        let start = Utc::now() + Duration::days(1);
        let mut new = NewTask::new("window", job, every(60));
        new.start_date = Some(start);
        let task = create(&ctx, new).await.unwrap();

        let entry = ctx.scheduler().get_job(&task.external_id).await.unwrap().unwrap();
        assert_eq!(entry.next_run_time, Some(start));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (ctx, job) = setup();
        let task = create(&ctx, NewTask::new("poll", job, every(60))).await.unwrap();
        delete(&ctx, "poll").await.unwrap();
        assert!(ctx.scheduler().get_job(&task.external_id).await.unwrap().is_none());
        assert!(ctx.store.fetch_task(Lookup::Name("poll")).unwrap().is_none());

        let err = delete(&ctx, "poll").await.unwrap_err();
        assert!(err.is_not_found());
    }
}

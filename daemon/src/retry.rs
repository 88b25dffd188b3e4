use chrono::{DateTime, Utc};
use common::{Job, JobId, JobKind, JobStatus, Outcome, Run, RunArgs, RunResults, Target};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::dispatcher::{self, AttemptResults};
use crate::error::Result;
use crate::inventory;
use crate::notifier;
use crate::registry::RunLog;
use crate::store::{require_job, Lookup};

#[derive(Debug, Clone, PartialEq)]
pub enum JobRef {
    Id(JobId),
    Name(String),
}

impl JobRef {
    fn lookup(&self) -> Lookup<'_> {
        match self {
            JobRef::Id(id) => Lookup::Id(id.0),
            JobRef::Name(name) => Lookup::Name(name),
        }
    }
}

/// A request to run a job now.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job: JobRef,
    /// Overrides the job's own targets.
    pub targets: Option<Vec<String>>,
    pub payload: Value,
    /// Set for workflow members and notification jobs.
    pub nested: bool,
}

impl RunRequest {
    pub fn by_id(id: JobId) -> Self {
        Self { job: JobRef::Id(id), targets: None, payload: Value::Null, nested: false }
    }

    pub fn by_name(name: &str) -> Self {
        Self { job: JobRef::Name(name.to_string()), targets: None, payload: Value::Null, nested: false }
    }

    pub fn targets(mut self, targets: Vec<String>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }
}

impl From<RunArgs> for RunRequest {
    fn from(args: RunArgs) -> Self {
        Self { job: JobRef::Id(args.job_id), targets: args.targets, payload: args.payload, nested: false }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub runtime: String,
    pub run: Run,
}

/// Key under which a run is recorded.
pub fn runtime_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H:%M:%S%.6f").to_string()
}

/// Run a job with its retry policy and record the result.
///
/// Only one `try_run` per job is in flight at a time; a concurrent call fails
/// with `AlreadyRunning`. The job is `Running` for the duration and `Idle`
/// again on every exit path.
pub fn try_run<'a>(ctx: &'a Arc<Context>, request: RunRequest) -> BoxFuture<'a, Result<RunReport>> {
    async move {
        let job = require_job(ctx.store.as_ref(), request.job.lookup())?;
        let _claim = ctx.claim(job.id, &job.name)?;
        set_status(ctx, job.id, JobStatus::Running)?;
        ctx.metrics.reset_progress(job.id);

        let started = Instant::now();
        let outcome = run_attempts(ctx, &job, &request).await;

        ctx.metrics.reset_progress(job.id);
        if let Err(e) = set_status(ctx, job.id, JobStatus::Idle) {
            log::error!("Failed to reset status of {}: {}", job.name, e);
        }

        let run = outcome?;
        ctx.store.append_run(&run)?;
        ctx.metrics
            .record_run(&job.name, run.success, started.elapsed().as_millis() as u64);
        log::info!(
            "Job {} finished: success={} after {} attempt(s)",
            job.name, run.success, run.attempts
        );

        if !request.nested && job.send_notification {
            notifier::notify(ctx, &job, &run).await;
        }

        Ok(RunReport { runtime: run.runtime.clone(), run })
    }
    .boxed()
}

fn set_status(ctx: &Context, id: JobId, status: JobStatus) -> Result<()> {
    let mut job = require_job(ctx.store.as_ref(), Lookup::Id(id.0))?;
    if job.status != status {
        job.status = status;
        ctx.store.save_job(job)?;
    }
    Ok(())
}

fn resolve_targets(ctx: &Context, job: &Job, request: &RunRequest) -> Vec<Target> {
    match (&job.kind, &request.targets) {
        (JobKind::Workflow(_), Some(_)) => {
            log::warn!("Ignoring explicit targets for workflow {}", job.name);
            Vec::new()
        }
        (JobKind::Workflow(_), None) => Vec::new(),
        (JobKind::Service(_), Some(names)) => inventory::resolve(ctx.inventory.as_ref(), names.iter()),
        (JobKind::Service(spec), None) => inventory::service_targets(ctx.inventory.as_ref(), spec),
    }
}

async fn run_attempts(ctx: &Arc<Context>, job: &Job, request: &RunRequest) -> Result<Run> {
    let started_at = Utc::now();
    let runtime = runtime_key(started_at);
    let log = Arc::new(RunLog::new(&job.name));
    let payload = Arc::new(request.payload.clone());
    let shared = Arc::new(job.clone());
    let delay = Duration::from_secs(job.retry_delay_seconds);

    let mut pending = resolve_targets(ctx, job, request);
    let mut succeeded: BTreeMap<String, Outcome> = BTreeMap::new();
    let mut attempt = 0;
    log.line(format!("Run {} started on {} target(s)", runtime, pending.len()));

    let results = loop {
        attempt += 1;
        let (results, done) = match dispatcher::dispatch(ctx, &shared, &pending, &payload, &log).await {
            AttemptResults::Single(outcome) => {
                let done = outcome.success;
                (RunResults::Single(outcome), done)
            }
            AttemptResults::PerTarget(outcomes) => {
                let mut failed = BTreeMap::new();
                for (name, outcome) in outcomes {
                    if outcome.success {
                        succeeded.insert(name, outcome);
                    } else {
                        failed.insert(name, outcome);
                    }
                }
                pending.retain(|t| failed.contains_key(&t.name));
                let done = failed.is_empty();
                let mut merged = succeeded.clone();
                merged.extend(failed);
                (RunResults::PerTarget(merged), done)
            }
        };

        if done || attempt > job.retry_count {
            break results;
        }
        log.line(format!(
            "Attempt {} failed on {} target(s), retrying in {}s",
            attempt,
            pending.len().max(1),
            job.retry_delay_seconds
        ));
        if !ctx.sleep(delay).await {
            log.line("Retry wait interrupted by shutdown");
            break results;
        }
    };

    let success = results.success();
    log.line(format!("Run {} finished: {}", runtime, if success { "success" } else { "failure" }));
    Ok(Run {
        runtime,
        job_id: job.id,
        job_name: job.name.clone(),
        success,
        results,
        attempts: attempt,
        logs: log.lines(),
        started_at,
        finished_at: Utc::now(),
    })
}

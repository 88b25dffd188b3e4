use chrono::Utc;
use common::{Job, JobStatus, Outcome, Run, RunResults};

use crate::context::Context;
use crate::error::Result;
use crate::retry::runtime_key;

/// Reset jobs left `Running` by a previous process. Each gets an aborted run
/// appended, and every workflow containing one is reset too.
///
/// Must run before any scheduler is started.
pub fn recover(ctx: &Context) -> Result<usize> {
    let stale: Vec<Job> = ctx
        .store
        .fetch_jobs()?
        .into_iter()
        .filter(|j| j.status == JobStatus::Running)
        .collect();

    for job in &stale {
        log::warn!("Job {} was running when the daemon stopped, marking it aborted", job.name);
        let now = Utc::now();
        ctx.store.append_run(&Run {
            runtime: runtime_key(now),
            job_id: job.id,
            job_name: job.name.clone(),
            success: false,
            results: RunResults::Single(Outcome::failure("aborted: daemon restarted during the run")),
            attempts: 0,
            logs: vec!["Run aborted by restart".to_string()],
            started_at: now,
            finished_at: now,
        })?;
        reset(ctx, job.clone())?;

        for parent in ctx.workflows_containing(job.id)? {
            if parent.status == JobStatus::Running {
                log::warn!("Resetting workflow {} containing {}", parent.name, job.name);
                reset(ctx, parent)?;
            }
        }
    }
    Ok(stale.len())
}

fn reset(ctx: &Context, mut job: Job) -> Result<()> {
    job.status = JobStatus::Idle;
    ctx.store.save_job(job)?;
    Ok(())
}

use common::{EdgeKind, Job, JobId, JobKind, WorkflowEdge, WorkflowSpec};
use std::collections::HashSet;

use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::store::{require_job, Lookup};

pub const START: &str = "Start";
pub const END: &str = "End";

impl Context {
    /// Create the global `Start` and `End` services if they are missing.
    pub fn ensure_sentinels(&self) -> Result<(JobId, JobId)> {
        let start = self.ensure_sentinel(START)?;
        let end = self.ensure_sentinel(END)?;
        Ok((start, end))
    }

    fn ensure_sentinel(&self, name: &str) -> Result<JobId> {
        if let Some(job) = self.store.fetch_job(Lookup::Name(name))? {
            return Ok(job.id);
        }
        let mut job = Job::service(name, "noop");
        job.description = format!("{} of every workflow", name);
        log::info!("Creating workflow sentinel {}", name);
        Ok(self.store.save_job(job)?.id)
    }

    pub fn is_sentinel(&self, job: &Job) -> bool {
        job.name == START || job.name == END
    }

    /// Insert a new job. Workflows get `Start`/`End` as members.
    pub fn define_job(&self, mut job: Job) -> Result<Job> {
        if self.store.fetch_job(Lookup::Name(&job.name))?.is_some() {
            return Err(EngineError::Conflict(format!("a job named '{}' already exists", job.name)));
        }
        job.id = JobId::default();
        job.status = Default::default();
        if let JobKind::Workflow(spec) = &mut job.kind {
            let (start, end) = self.ensure_sentinels()?;
            spec.start = start;
            spec.end = end;
            for id in [start, end] {
                if !spec.contains(id) {
                    spec.members.push(id);
                }
            }
        }
        self.validate(&job)?;
        let job = self.store.save_job(job)?;
        log::info!("Defined job {} ({})", job.name, job.id);
        Ok(job)
    }

    pub fn create_workflow(&self, name: &str) -> Result<Job> {
        self.define_job(Job::new(name, JobKind::Workflow(WorkflowSpec::default())))
    }

    /// Add an existing job to a workflow.
    pub fn add_member(&self, workflow: &str, member: &str) -> Result<Job> {
        let member = require_job(self.store.as_ref(), Lookup::Name(member))?;
        self.update_workflow(workflow, |workflow, spec| {
            if member.id == workflow.id {
                return Err(EngineError::InvalidDefinition(format!(
                    "workflow {} cannot contain itself",
                    workflow.name
                )));
            }
            if !spec.contains(member.id) {
                spec.members.push(member.id);
            }
            Ok(())
        })
    }

    /// Add a typed edge between two members of `workflow`.
    pub fn connect(&self, workflow: &str, source: &str, destination: &str, subtype: EdgeKind) -> Result<Job> {
        let source = require_job(self.store.as_ref(), Lookup::Name(source))?;
        let destination = require_job(self.store.as_ref(), Lookup::Name(destination))?;
        self.update_workflow(workflow, |_, spec| {
            let edge = WorkflowEdge { source: source.id, destination: destination.id, subtype };
            if !spec.edges.contains(&edge) {
                spec.edges.push(edge);
            }
            Ok(())
        })
    }

    /// Delete a job no task or workflow refers to.
    pub fn remove_definition(&self, name: &str) -> Result<()> {
        let job = require_job(self.store.as_ref(), Lookup::Name(name))?;
        if self.is_sentinel(&job) {
            return Err(EngineError::Conflict(format!("{} is a workflow sentinel", job.name)));
        }
        if let Some(task) = self.store.fetch_tasks()?.into_iter().find(|t| t.job_id == job.id) {
            return Err(EngineError::Conflict(format!("{} is scheduled by task {}", job.name, task.name)));
        }
        if let Some(parent) = self.workflows_containing(job.id)?.into_iter().next() {
            return Err(EngineError::Conflict(format!("{} is a member of {}", job.name, parent.name)));
        }
        self.store.delete_job(job.id)?;
        log::info!("Removed job {}", job.name);
        Ok(())
    }

    pub fn workflows_containing(&self, member: JobId) -> Result<Vec<Job>> {
        Ok(self
            .store
            .fetch_jobs()?
            .into_iter()
            .filter(|j| j.as_workflow().is_some_and(|spec| spec.contains(member)))
            .collect())
    }

    fn update_workflow(
        &self,
        name: &str,
        change: impl FnOnce(&Job, &mut WorkflowSpec) -> Result<()>,
    ) -> Result<Job> {
        let mut job = require_job(self.store.as_ref(), Lookup::Name(name))?;
        let snapshot = job.clone();
        let JobKind::Workflow(spec) = &mut job.kind else {
            return Err(EngineError::InvalidDefinition(format!("{} is not a workflow", name)));
        };
        change(&snapshot, spec)?;
        self.validate(&job)?;
        self.store.save_job(job)
    }

    fn validate(&self, job: &Job) -> Result<()> {
        if job.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition("job name is empty".to_string()));
        }
        match &job.kind {
            JobKind::Service(spec) => {
                if self.registry.get(&spec.implementation).is_none() {
                    return Err(EngineError::InvalidDefinition(format!(
                        "no executable registered for '{}'",
                        spec.implementation
                    )));
                }
            }
            JobKind::Workflow(spec) => {
                let members: HashSet<JobId> = spec.members.iter().copied().collect();
                for id in &members {
                    require_job(self.store.as_ref(), Lookup::Id(id.0))?;
                }
                if !members.contains(&spec.start) || !members.contains(&spec.end) {
                    return Err(EngineError::InvalidDefinition(format!(
                        "workflow {} lacks its Start/End members",
                        job.name
                    )));
                }
                for edge in &spec.edges {
                    if !members.contains(&edge.source) || !members.contains(&edge.destination) {
                        return Err(EngineError::InvalidDefinition(format!(
                            "{} edge {} -> {} leaves workflow {}",
                            edge.subtype, edge.source, edge.destination, job.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

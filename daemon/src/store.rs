use common::{Job, JobId, Run, ScheduledJob, Task, TaskId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, Result};

/// Jobs and tasks are looked up by numeric id or by their unique name.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Id(i64),
    Name(&'a str),
}

impl std::fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Id(id) => write!(f, "#{}", id),
            Lookup::Name(name) => f.write_str(name),
        }
    }
}

impl From<JobId> for Lookup<'_> {
    fn from(id: JobId) -> Self {
        Lookup::Id(id.0)
    }
}

impl From<TaskId> for Lookup<'_> {
    fn from(id: TaskId) -> Self {
        Lookup::Id(id.0)
    }
}

impl<'a> From<&'a str> for Lookup<'a> {
    fn from(name: &'a str) -> Self {
        Lookup::Name(name)
    }
}

/// Persistence the engine relies on. Implementations serialize concurrent
/// writes to the same entity; the engine adds no locking of its own.
pub trait Store: Send + Sync {
    fn fetch_job(&self, lookup: Lookup<'_>) -> Result<Option<Job>>;
    fn fetch_jobs(&self) -> Result<Vec<Job>>;
    /// Inserts when `job.id` is zero, otherwise replaces. Returns the stored job.
    fn save_job(&self, job: Job) -> Result<Job>;
    fn delete_job(&self, id: JobId) -> Result<()>;

    fn append_run(&self, run: &Run) -> Result<()>;
    /// Oldest first.
    fn fetch_runs(&self, job: JobId) -> Result<Vec<Run>>;

    fn fetch_task(&self, lookup: Lookup<'_>) -> Result<Option<Task>>;
    fn fetch_tasks(&self) -> Result<Vec<Task>>;
    fn save_task(&self, task: Task) -> Result<Task>;
    fn delete_task(&self, id: TaskId) -> Result<()>;

    fn fetch_entries(&self) -> Result<Vec<ScheduledJob>>;
    fn save_entry(&self, entry: &ScheduledJob) -> Result<()>;
    fn delete_entry(&self, id: &str) -> Result<()>;
}

/// Fetch a job or fail with `NotFound`.
pub fn require_job(store: &dyn Store, lookup: Lookup<'_>) -> Result<Job> {
    store
        .fetch_job(lookup)?
        .ok_or_else(|| EngineError::not_found("Job", lookup))
}

pub fn require_task(store: &dyn Store, lookup: Lookup<'_>) -> Result<Task> {
    store
        .fetch_task(lookup)?
        .ok_or_else(|| EngineError::not_found("Task", lookup))
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<i64, Job>,
    runs: HashMap<i64, Vec<Run>>,
    tasks: BTreeMap<i64, Task>,
    entries: BTreeMap<String, ScheduledJob>,
}

impl MemoryState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store, used by tests and by daemons without a database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn fetch_job(&self, lookup: Lookup<'_>) -> Result<Option<Job>> {
        let state = self.lock();
        Ok(match lookup {
            Lookup::Id(id) => state.jobs.get(&id).cloned(),
            Lookup::Name(name) => state.jobs.values().find(|j| j.name == name).cloned(),
        })
    }

    fn fetch_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.lock().jobs.values().cloned().collect())
    }

    fn save_job(&self, mut job: Job) -> Result<Job> {
        let mut state = self.lock();
        if state
            .jobs
            .values()
            .any(|existing| existing.name == job.name && existing.id != job.id)
        {
            return Err(EngineError::Conflict(format!("a job named '{}' already exists", job.name)));
        }
        if job.id.0 == 0 {
            job.id = JobId(state.allocate());
        }
        state.jobs.insert(job.id.0, job.clone());
        Ok(job)
    }

    fn delete_job(&self, id: JobId) -> Result<()> {
        let mut state = self.lock();
        state.jobs.remove(&id.0);
        state.runs.remove(&id.0);
        Ok(())
    }

    fn append_run(&self, run: &Run) -> Result<()> {
        self.lock().runs.entry(run.job_id.0).or_default().push(run.clone());
        Ok(())
    }

    fn fetch_runs(&self, job: JobId) -> Result<Vec<Run>> {
        Ok(self.lock().runs.get(&job.0).cloned().unwrap_or_default())
    }

    fn fetch_task(&self, lookup: Lookup<'_>) -> Result<Option<Task>> {
        let state = self.lock();
        Ok(match lookup {
            Lookup::Id(id) => state.tasks.get(&id).cloned(),
            Lookup::Name(name) => state.tasks.values().find(|t| t.name == name).cloned(),
        })
    }

    fn fetch_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().tasks.values().cloned().collect())
    }

    fn save_task(&self, mut task: Task) -> Result<Task> {
        let mut state = self.lock();
        if state
            .tasks
            .values()
            .any(|existing| existing.name == task.name && existing.id != task.id)
        {
            return Err(EngineError::Conflict(format!("a task named '{}' already exists", task.name)));
        }
        if task.id.0 == 0 {
            task.id = TaskId(state.allocate());
        }
        state.tasks.insert(task.id.0, task.clone());
        Ok(task)
    }

    fn delete_task(&self, id: TaskId) -> Result<()> {
        self.lock().tasks.remove(&id.0);
        Ok(())
    }

    fn fetch_entries(&self) -> Result<Vec<ScheduledJob>> {
        Ok(self.lock().entries.values().cloned().collect())
    }

    fn save_entry(&self, entry: &ScheduledJob) -> Result<()> {
        self.lock().entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn delete_entry(&self, id: &str) -> Result<()> {
        self.lock().entries.remove(id);
        Ok(())
    }
}

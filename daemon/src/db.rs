use common::{Job, JobId, JobStatus, Run, ScheduledJob, Task, TaskId};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, Result};
use crate::migrations::Migrator;
use crate::store::{Lookup, Store};

/// SQLite-backed store. Entities are kept as JSON bodies next to the columns
/// used for lookups.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let mut migrator = Migrator::new(conn);
        migrator.run_migrations()?;
        Ok(Self { conn: Mutex::new(migrator.into_connection()) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Idle => "idle",
        JobStatus::Running => "running",
    }
}

/// Unique-name violations become `Conflict`.
fn unique(err: rusqlite::Error, what: &str) -> EngineError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            EngineError::Conflict(format!("{} already exists", what))
        }
        _ => EngineError::Database(err),
    }
}

fn decode_job(id: i64, body: &str) -> Result<Job> {
    let mut job: Job = serde_json::from_str(body)?;
    job.id = JobId(id);
    Ok(job)
}

fn decode_task(id: i64, body: &str) -> Result<Task> {
    let mut task: Task = serde_json::from_str(body)?;
    task.id = TaskId(id);
    Ok(task)
}

impl Store for SqliteStore {
    fn fetch_job(&self, lookup: Lookup<'_>) -> Result<Option<Job>> {
        let conn = self.conn();
        let row: Option<(i64, String)> = match lookup {
            Lookup::Id(id) => conn
                .query_row("SELECT id, body FROM jobs WHERE id = ?1", params![id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?,
            Lookup::Name(name) => conn
                .query_row("SELECT id, body FROM jobs WHERE name = ?1", params![name], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?,
        };
        row.map(|(id, body)| decode_job(id, &body)).transpose()
    }

    fn fetch_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, body FROM jobs ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, body) = row?;
            jobs.push(decode_job(id, &body)?);
        }
        Ok(jobs)
    }

    fn save_job(&self, mut job: Job) -> Result<Job> {
        let kind = if job.is_workflow() { "workflow" } else { "service" };
        let body = serde_json::to_string(&job)?;
        let conn = self.conn();
        if job.id.0 == 0 {
            conn.execute(
                "INSERT INTO jobs (name, kind, status, body) VALUES (?1, ?2, ?3, ?4)",
                params![job.name, kind, status_label(job.status), body],
            )
            .map_err(|e| unique(e, &format!("a job named '{}'", job.name)))?;
            job.id = JobId(conn.last_insert_rowid());
        } else {
            conn.execute(
                "INSERT OR REPLACE INTO jobs (id, name, kind, status, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job.id.0, job.name, kind, status_label(job.status), body],
            )
            .map_err(|e| unique(e, &format!("a job named '{}'", job.name)))?;
        }
        Ok(job)
    }

    fn delete_job(&self, id: JobId) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM history WHERE job_id = ?1", params![id.0])?;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    fn append_run(&self, run: &Run) -> Result<()> {
        let body = serde_json::to_string(run)?;
        self.conn().execute(
            "INSERT INTO history (job_id, runtime, success, body) VALUES (?1, ?2, ?3, ?4)",
            params![run.job_id.0, run.runtime, run.success, body],
        )?;
        Ok(())
    }

    fn fetch_runs(&self, job: JobId) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT body FROM history WHERE job_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![job.0], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for body in rows {
            runs.push(serde_json::from_str(&body?)?);
        }
        Ok(runs)
    }

    fn fetch_task(&self, lookup: Lookup<'_>) -> Result<Option<Task>> {
        let conn = self.conn();
        let row: Option<(i64, String)> = match lookup {
            Lookup::Id(id) => conn
                .query_row("SELECT id, body FROM tasks WHERE id = ?1", params![id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?,
            Lookup::Name(name) => conn
                .query_row("SELECT id, body FROM tasks WHERE name = ?1", params![name], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?,
        };
        row.map(|(id, body)| decode_task(id, &body)).transpose()
    }

    fn fetch_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, body FROM tasks ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut tasks = Vec::new();
        for row in rows {
            let (id, body) = row?;
            tasks.push(decode_task(id, &body)?);
        }
        Ok(tasks)
    }

    fn save_task(&self, mut task: Task) -> Result<Task> {
        let status = format!("{:?}", task.status).to_lowercase();
        let body = serde_json::to_string(&task)?;
        let conn = self.conn();
        if task.id.0 == 0 {
            conn.execute(
                "INSERT INTO tasks (name, external_id, job_id, status, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task.name, task.external_id, task.job_id.0, status, body],
            )
            .map_err(|e| unique(e, &format!("a task named '{}'", task.name)))?;
            task.id = TaskId(conn.last_insert_rowid());
        } else {
            conn.execute(
                "INSERT OR REPLACE INTO tasks (id, name, external_id, job_id, status, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![task.id.0, task.name, task.external_id, task.job_id.0, status, body],
            )
            .map_err(|e| unique(e, &format!("a task named '{}'", task.name)))?;
        }
        Ok(task)
    }

    fn delete_task(&self, id: TaskId) -> Result<()> {
        self.conn().execute("DELETE FROM tasks WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    fn fetch_entries(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT body FROM scheduled_jobs ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for body in rows {
            entries.push(serde_json::from_str(&body?)?);
        }
        Ok(entries)
    }

    fn save_entry(&self, entry: &ScheduledJob) -> Result<()> {
        let body = serde_json::to_string(entry)?;
        let next = entry.next_run_time.map(|t| t.to_rfc3339());
        self.conn().execute(
            "INSERT OR REPLACE INTO scheduled_jobs (id, next_run_time, body) VALUES (?1, ?2, ?3)",
            params![entry.id, next, body],
        )?;
        Ok(())
    }

    fn delete_entry(&self, id: &str) -> Result<()> {
        self.conn().execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
        Ok(())
    }
}

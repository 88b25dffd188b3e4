use rusqlite::{Connection, Result};

struct Migration {
    version: i32,
    description: &'static str,
    sql: &'static str,
}

/// Applied in order; the schema version is kept in `PRAGMA user_version`.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "jobs and run history",
        // Jobs are stored as JSON bodies; name and status are lifted out for lookups.
        sql: "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY,
                job_id INTEGER NOT NULL,
                runtime TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                body TEXT NOT NULL,
                recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_history_job_id ON history(job_id);",
    },
    Migration {
        version: 2,
        description: "tasks and scheduler entries",
        sql: "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                external_id TEXT NOT NULL UNIQUE,
                job_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            );
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                next_run_time TEXT,
                body TEXT NOT NULL
            );",
    },
];

pub struct Migrator {
    conn: Connection,
}

impl Migrator {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn latest() -> i32 {
        MIGRATIONS.last().map_or(0, |m| m.version)
    }

    pub fn version(&self) -> Result<i32> {
        self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))
    }

    /// Bring the schema up to date in one transaction.
    pub fn run_migrations(&mut self) -> Result<()> {
        let current = self.version()?;
        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            log::debug!("Database schema is at version {}", current);
            return Ok(());
        }

        log::info!("Migrating database from version {} to {}", current, Self::latest());
        let tx = self.conn.transaction()?;
        for migration in pending {
            log::info!("Applying migration {}: {}", migration.version, migration.description);
            tx.execute_batch(migration.sql)?;
            tx.pragma_update(None, "user_version", migration.version)?;
        }
        tx.commit()
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

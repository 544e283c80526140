use super::models::{Job, Tier, Trigger};
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// SQLite-backed job store.
///
/// Writes go straight to SQLite. An in-memory index mirrors the table and is
/// only updated after the corresponding statement succeeded, so reads never
/// observe a change that is not durable.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    index: RwLock<HashMap<String, Job>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open job database at {:?}", path))?;
        let _journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;

        if is_new_db {
            info!("Creating new job database at {:?}", path);
            Self::latest_schema()?.create(&conn)?;
        } else {
            open_versioned(&mut conn, JOB_STORE_VERSIONED_SCHEMAS)
                .context("Failed to open existing job database")?;
        }

        Self::from_connection(conn)
    }

    /// Non-durable store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::latest_schema()?.create(&conn)?;
        Self::from_connection(conn)
    }

    fn latest_schema() -> Result<&'static crate::sqlite_persistence::VersionedSchema> {
        JOB_STORE_VERSIONED_SCHEMAS
            .last()
            .context("No job store schema declared")
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA synchronous = FULL;")?;

        let jobs = {
            let mut stmt = conn.prepare(
                "SELECT id, name, tier, trigger_spec, handler_ref, next_run_time, paused FROM jobs",
            )?;
            let jobs = stmt
                .query_map([], Self::row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to load jobs")?;
            jobs
        };
        debug!("Loaded {} jobs from job database", jobs.len());

        let index = jobs.into_iter().map(|job| (job.id.clone(), job)).collect();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            index: RwLock::new(index),
        })
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let trigger_json: String = row.get("trigger_spec")?;
        let trigger: Trigger = serde_json::from_str(&trigger_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

        let next_run_time_str: String = row.get("next_run_time")?;
        let next_run_time = DateTime::parse_from_rfc3339(&next_run_time_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        let tier: String = row.get("tier")?;
        let paused: i64 = row.get("paused")?;

        Ok(Job {
            id: row.get("id")?,
            name: row.get("name")?,
            tier: Tier::parse(&tier),
            trigger,
            next_run_time,
            paused: paused != 0,
            handler_ref: row.get("handler_ref")?,
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Job store connection lock poisoned"))
    }

    /// Apply `f` to the indexed job, if present.
    fn update_index<F: FnOnce(&mut Job)>(&self, id: &str, f: F) -> Result<()> {
        let mut index = self
            .index
            .write()
            .map_err(|_| anyhow!("Job store index lock poisoned"))?;
        if let Some(job) = index.get_mut(id) {
            f(job);
        }
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn add_job(&self, job: &Job) -> Result<()> {
        let conn = self.lock_conn()?;
        let trigger = serde_json::to_string(&job.trigger)?;
        conn.execute(
            "INSERT INTO jobs (id, name, tier, trigger_spec, handler_ref, next_run_time, paused, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                name = ?2, tier = ?3, trigger_spec = ?4, handler_ref = ?5,
                next_run_time = ?6, paused = ?7, updated_at = datetime('now')",
            params![
                job.id,
                job.name,
                job.tier.as_str(),
                trigger,
                job.handler_ref,
                Self::format_datetime(&job.next_run_time),
                job.paused as i64,
            ],
        )
        .with_context(|| format!("Failed to write job {}", job.id))?;

        self.index
            .write()
            .map_err(|_| anyhow!("Job store index lock poisoned"))?
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let index = self
            .index
            .read()
            .map_err(|_| anyhow!("Job store index lock poisoned"))?;
        Ok(index.get(id).cloned())
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let index = self
            .index
            .read()
            .map_err(|_| anyhow!("Job store index lock poisoned"))?;
        let mut jobs: Vec<Job> = index.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    fn remove_job(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to remove job {}", id))?;

        self.index
            .write()
            .map_err(|_| anyhow!("Job store index lock poisoned"))?
            .remove(id);
        Ok(removed > 0)
    }

    fn set_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET paused = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, paused as i64],
            )
            .with_context(|| format!("Failed to update paused flag of job {}", id))?;
        if updated == 0 {
            return Ok(false);
        }

        self.update_index(id, |job| job.paused = paused)?;
        Ok(true)
    }

    fn update_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET next_run_time = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, Self::format_datetime(&next_run_time)],
            )
            .with_context(|| format!("Failed to update next run time of job {}", id))?;
        if updated == 0 {
            return Ok(false);
        }

        self.update_index(id, |job| job.next_run_time = next_run_time)?;
        Ok(true)
    }

    fn advance_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET next_run_time = ?2, updated_at = datetime('now')
                 WHERE id = ?1 AND paused = 0",
                params![id, Self::format_datetime(&next_run_time)],
            )
            .with_context(|| format!("Failed to advance next run time of job {}", id))?;
        if updated == 0 {
            return Ok(false);
        }

        self.update_index(id, |job| job.next_run_time = next_run_time)?;
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |_| Ok(()))
            .context("Failed to checkpoint job database")?;
        Ok(())
    }
}

use super::models::{Job, JobStatus, JobStatusCount};
use super::schema::JOB_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::open_versioned_db;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str =
    "id, job_type, status, message, created_at, started_at, last_activity_at, finished_at, data";

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = open_versioned_db(path, JOB_VERSIONED_SCHEMAS, "job")?;
        info!("Job database ready at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job database connection mutex poisoned"))
    }

    fn to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    /// Unknown statuses only come from a foreign writer; they read as failed.
    fn parse_status(id: &str, raw: &str) -> JobStatus {
        JobStatus::parse(raw).unwrap_or_else(|| {
            warn!("Job {} has unknown status '{}', reading it as error", id, raw);
            JobStatus::Error
        })
    }

    fn parse_data(id: &str, raw: &str) -> HashMap<String, String> {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("Job {} has malformed data, reading it as empty: {}", id, e);
            HashMap::new()
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let id: String = row.get("id")?;
        let status_str: String = row.get("status")?;
        let data_str: String = row.get("data")?;

        Ok(Job {
            status: Self::parse_status(&id, &status_str),
            data: Self::parse_data(&id, &data_str),
            id,
            job_type: row.get("job_type")?,
            message: row.get("message")?,
            created_at: Self::from_millis(row.get("created_at")?),
            started_at: row
                .get::<_, Option<i64>>("started_at")?
                .map(Self::from_millis),
            last_activity_at: Self::from_millis(row.get("last_activity_at")?),
            finished_at: row
                .get::<_, Option<i64>>("finished_at")?
                .map(Self::from_millis),
        })
    }

    fn query_jobs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params, Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn status_list(statuses: &[JobStatus]) -> String {
        statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job_type: &str, data: &HashMap<String, String>) -> Result<Job> {
        // Truncate to the stored precision so the returned job matches a later read
        let now = Self::from_millis(Self::to_millis(&Utc::now()));
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            status: JobStatus::Pending,
            message: None,
            created_at: now,
            started_at: None,
            last_activity_at: now,
            finished_at: None,
            data: data.clone(),
        };
        let data_json = serde_json::to_string(&job.data)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, created_at, last_activity_at, data)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
            params![
                job.id,
                job.job_type,
                job.status.as_str(),
                Self::to_millis(&now),
                data_json
            ],
        )
        .with_context(|| format!("Failed to insert job of type {}", job_type))?;

        debug!("Created job {} of type {}", job.id, job_type);
        Ok(job)
    }

    fn claim_next_pending(&self, job_type: &str) -> Result<Option<Job>> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front, so two processes cannot both
        // read the same candidate and race on the update.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE job_type = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1",
                params![job_type],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let now = Self::to_millis(&Utc::now());
        let changed = tx.execute(
            "UPDATE jobs SET status = 'in_progress', started_at = ?1, last_activity_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        if changed != 1 {
            tx.commit()?;
            return Ok(None);
        }

        let job = tx.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )?;
        tx.commit()?;

        debug!("Claimed job {} of type {}", job.id, job_type);
        Ok(Some(job))
    }

    fn update_status(&self, id: &str, status: JobStatus, message: Option<&str>) -> Result<bool> {
        let predecessors = status.allowed_predecessors();
        if predecessors.is_empty() {
            return Ok(false);
        }

        let conn = self.conn()?;
        let now = Self::to_millis(&Utc::now());
        let changed = conn.execute(
            &format!(
                "UPDATE jobs SET
                    status = ?1,
                    message = COALESCE(?2, message),
                    last_activity_at = ?3,
                    started_at = CASE WHEN ?1 = 'in_progress' THEN COALESCE(started_at, ?3) ELSE started_at END,
                    finished_at = CASE WHEN ?4 THEN ?3 ELSE finished_at END
                 WHERE id = ?5 AND status IN ({})",
                Self::status_list(predecessors)
            ),
            params![status.as_str(), message, now, status.is_terminal(), id],
        )?;
        Ok(changed == 1)
    }

    fn list_non_terminal_by_type(&self, job_type: &str) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        Self::query_jobs(
            &conn,
            &format!(
                "SELECT {} FROM jobs
                 WHERE job_type = ?1 AND status IN ('pending', 'in_progress')
                 ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ),
            params![job_type],
        )
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        Self::query_jobs(
            &conn,
            &format!(
                "SELECT {} FROM jobs WHERE job_type = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                JOB_COLUMNS
            ),
            params![job_type, limit as i64],
        )
    }

    fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        Self::query_jobs(
            &conn,
            &format!(
                "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                JOB_COLUMNS
            ),
            params![limit as i64],
        )
    }

    fn touch_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET last_activity_at = ?1 WHERE id = ?2 AND status = 'in_progress'",
            params![Self::to_millis(&Utc::now()), id],
        )?;
        Ok(changed == 1)
    }

    fn fail_stale_jobs(&self, inactive_since: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let now = Self::to_millis(&Utc::now());
        let message = format!(
            "job timed out: no activity since {}",
            inactive_since.to_rfc3339()
        );
        let count = conn.execute(
            "UPDATE jobs SET status = 'error', message = ?1, last_activity_at = ?2, finished_at = ?2
             WHERE status = 'in_progress' AND last_activity_at < ?3",
            params![message, now, Self::to_millis(&inactive_since)],
        )?;
        Ok(count)
    }

    fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('success', 'error', 'canceled') AND finished_at < ?1",
            params![Self::to_millis(&cutoff)],
        )?;
        Ok(count)
    }

    fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_type, status, COUNT(*) FROM jobs
             GROUP BY job_type, status ORDER BY job_type, status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(job_type, status, count)| {
                JobStatus::parse(&status).map(|status| JobStatusCount {
                    job_type,
                    status,
                    count: count as usize,
                })
            })
            .collect())
    }
}

//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{Job, JobId, JobState, NewJob};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use std::collections::HashSet;

use super::{JobStore, JobTransaction};
use crate::{DbError, DbResult};

/// Select jobs together with their outgoing dependency ids.
macro_rules! select_jobs {
    ($tail:literal) => {
        concat!(
            "SELECT j.id, j.command, j.args, j.state, j.created_at, j.started_at, j.closed_at, ",
            "ARRAY(SELECT d.dependency_id FROM job_dependencies d ",
            "WHERE d.job_id = j.id ORDER BY d.dependency_id) AS dependencies ",
            "FROM jobs j ",
            $tail
        )
    };
}

const UPDATE_STATE: &str = r#"
    UPDATE jobs SET
        state = $2,
        started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
        closed_at = CASE
            WHEN $2 IN ('finished', 'failed', 'terminated', 'canceled') THEN NOW()
            ELSE closed_at
        END
    WHERE id = $1
"#;

/// Dedup lookup; served by `jobs_command_args_idx`.
const FIND_BY_KEY: &str =
    select_jobs!("WHERE j.command = $1 AND j.args = $2 ORDER BY j.id LIMIT 1");

/// A job row as stored in the database.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    command: String,
    args: Json<Vec<Value>>,
    state: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    dependencies: Vec<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| DbError::Corrupt(format!("job {}: {}", row.id, e)))?;
        Ok(Job {
            id: JobId::new(row.id),
            command: row.command,
            args: row.args.0,
            state,
            dependencies: row.dependencies.into_iter().map(JobId::new).collect(),
            created_at: row.created_at,
            started_at: row.started_at,
            closed_at: row.closed_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> DbResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

async fn fetch_job<'e>(
    executor: impl PgExecutor<'e>,
    id: JobId,
    for_update: bool,
) -> DbResult<Option<Job>> {
    let query = if for_update {
        select_jobs!("WHERE j.id = $1 FOR UPDATE OF j")
    } else {
        select_jobs!("WHERE j.id = $1")
    };
    sqlx::query_as::<_, JobRow>(query)
        .bind(id.get())
        .fetch_optional(executor)
        .await?
        .map(Job::try_from)
        .transpose()
}

async fn fetch_dependents<'e>(
    executor: impl PgExecutor<'e>,
    id: JobId,
    for_update: bool,
) -> DbResult<Vec<Job>> {
    let query = if for_update {
        select_jobs!(
            "WHERE j.id IN (SELECT job_id FROM job_dependencies WHERE dependency_id = $1) \
             ORDER BY j.id FOR UPDATE OF j"
        )
    } else {
        select_jobs!(
            "WHERE j.id IN (SELECT job_id FROM job_dependencies WHERE dependency_id = $1) \
             ORDER BY j.id"
        )
    };
    let rows = sqlx::query_as::<_, JobRow>(query)
        .bind(id.get())
        .fetch_all(executor)
        .await?;
    into_jobs(rows)
}

async fn write_state<'e>(
    executor: impl PgExecutor<'e>,
    id: JobId,
    state: JobState,
) -> DbResult<()> {
    let result = sqlx::query(UPDATE_STATE)
        .bind(id.get())
        .bind(state.as_str())
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("job {}", id)));
    }
    Ok(())
}

/// PostgreSQL implementation of [`JobStore`].
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_by_key(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        sqlx::query_as::<_, JobRow>(FIND_BY_KEY)
        .bind(command)
        .bind(Json(args))
        .fetch_optional(&self.pool)
        .await?
        .map(Job::try_from)
        .transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (command, args, state, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id
            "#,
        )
        .bind(&job.command)
        .bind(Json(&job.args))
        .bind(job.state.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if !job.dependencies.is_empty() {
            let deps: Vec<i64> = job.dependencies.iter().map(JobId::get).collect();
            sqlx::query(
                r#"
                INSERT INTO job_dependencies (job_id, dependency_id)
                SELECT $1, UNNEST($2::BIGINT[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(id)
            .bind(&deps)
            .execute(&mut *tx)
            .await?;
        }

        let record = fetch_job(&mut *tx, JobId::new(id), false)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, id: JobId) -> DbResult<Option<Job>> {
        fetch_job(&self.pool, id, false).await
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> DbResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(JobId::get).collect();
        let rows = sqlx::query_as::<_, JobRow>(select_jobs!(
            "WHERE j.id = ANY($1) ORDER BY j.id"
        ))
        .bind(&raw)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn find_one(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        self.find_by_key(command, args).await
    }

    async fn find_oldest(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        self.find_by_key(command, args).await
    }

    async fn find_one_pending(&self, excluded: &HashSet<JobId>) -> DbResult<Option<Job>> {
        let excluded: Vec<i64> = excluded.iter().map(JobId::get).collect();
        sqlx::query_as::<_, JobRow>(select_jobs!(
            "WHERE j.state = 'pending' AND NOT (j.id = ANY($1)) ORDER BY j.id LIMIT 1"
        ))
        .bind(&excluded)
        .fetch_optional(&self.pool)
        .await?
        .map(Job::try_from)
        .transpose()
    }

    async fn find_incoming_dependents(&self, id: JobId) -> DbResult<Vec<Job>> {
        fetch_dependents(&self.pool, id, false).await
    }

    async fn set_state(&self, id: JobId, state: JobState) -> DbResult<()> {
        write_state(&self.pool, id, state).await
    }

    async fn claim(&self, id: JobId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'running', started_at = NOW()
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, id: JobId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_dependency(&self, job: JobId, dependency: JobId) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_dependencies (job_id, dependency_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.get())
        .bind(dependency.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(select_jobs!(
            "WHERE ($1::TEXT IS NULL OR j.state = $1) ORDER BY j.id LIMIT $2"
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn count_by_state(&self) -> DbResult<Vec<(JobState, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(state, count)| {
                let state = state
                    .parse::<JobState>()
                    .map_err(|e| DbError::Corrupt(e.to_string()))?;
                Ok((state, count))
            })
            .collect()
    }

    async fn begin(&self) -> DbResult<Box<dyn JobTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgJobTransaction { tx }))
    }
}

/// Transaction over a [`PgJobStore`]. Rows read through it are locked until
/// the transaction ends.
pub struct PgJobTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl JobTransaction for PgJobTransaction {
    async fn get(&mut self, id: JobId) -> DbResult<Option<Job>> {
        fetch_job(&mut *self.tx, id, true).await
    }

    async fn find_incoming_dependents(&mut self, id: JobId) -> DbResult<Vec<Job>> {
        fetch_dependents(&mut *self.tx, id, true).await
    }

    async fn update_state(&mut self, id: JobId, state: JobState) -> DbResult<()> {
        write_state(&mut *self.tx, id, state).await
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

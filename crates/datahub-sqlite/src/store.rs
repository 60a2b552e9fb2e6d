use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, SqlitePool};

use datahub_core::event::Event;
use datahub_core::job::{Job, JobKind, JobState};
use datahub_core::progress::{Progress, ProgressPersistence};
use datahub_core::store::{Conn, ExecResult, JobStore, ListFilter, PoolMetrics, QueryResult, Store, Tx};
use datahub_core::{DataHubError, Result};

fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    args: &[Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for v in args {
        query = match v {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Best-effort dynamic column decode: SQLite is dynamically typed per
/// cell, so we try the narrowest types first and fall back to text.
/// Good enough for the ad hoc queries `DataSource`/export jobs issue;
/// anything needing precise typing goes through the typed `JobStore`
/// methods below instead.
fn row_to_map(row: &SqliteRow) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let value = row
            .try_get::<i64, _>(idx)
            .map(Value::from)
            .or_else(|_| row.try_get::<f64, _>(idx).map(|v| json!(v)))
            .or_else(|_| row.try_get::<String, _>(idx).map(Value::from))
            .or_else(|_| row.try_get::<bool, _>(idx).map(Value::from))
            .unwrap_or(Value::Null);
        map.insert(col.name().to_string(), value);
    }
    map
}

pub struct SqliteConn(sqlx::pool::PoolConnection<sqlx::Sqlite>);

#[async_trait]
impl Conn for SqliteConn {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        let q = bind_args(sqlx::query(sql), args);
        let rows = q
            .fetch_all(&mut *self.0)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(QueryResult {
            rows: rows.iter().map(row_to_map).collect(),
        })
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let q = bind_args(sqlx::query(sql), args);
        let done = q
            .execute(&mut *self.0)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(ExecResult {
            rows_affected: done.rows_affected(),
            last_insert_id: Some(done.last_insert_rowid()),
        })
    }
}

pub struct SqliteTx(Option<sqlx::Transaction<'static, sqlx::Sqlite>>);

#[async_trait]
impl Tx for SqliteTx {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        let tx = self.0.as_mut().expect("transaction already consumed");
        let q = bind_args(sqlx::query(sql), args);
        let rows = q
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(QueryResult {
            rows: rows.iter().map(row_to_map).collect(),
        })
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let tx = self.0.as_mut().expect("transaction already consumed");
        let q = bind_args(sqlx::query(sql), args);
        let done = q
            .execute(&mut **tx)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(ExecResult {
            rows_affected: done.rows_affected(),
            last_insert_id: Some(done.last_insert_rowid()),
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.0.take().expect("transaction already consumed");
        tx.commit()
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.0.take().expect("transaction already consumed");
        tx.rollback()
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))
    }
}

/// The concrete connection pool backing both `Store` (spec §4.1) and
/// `JobStore` (spec §4.2), and optionally `ProgressPersistence` (spec
/// §4.6).
pub struct SqliteStore {
    pool: SqlitePool,
    capacity: usize,
    lease_timeouts: AtomicU64,
    slow_queries: AtomicU64,
}

impl SqliteStore {
    pub(crate) fn new(pool: SqlitePool, capacity: usize) -> Self {
        Self {
            pool,
            capacity,
            lease_timeouts: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn lease(&self) -> Result<Box<dyn Conn>> {
        let conn = self.pool.acquire().await.map_err(|e| {
            self.lease_timeouts.fetch_add(1, Ordering::Relaxed);
            DataHubError::ResourceExhausted(format!("lease timed out: {e}"))
        })?;
        Ok(Box::new(SqliteConn(conn)))
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        let mut conn = self.lease().await?;
        conn.query(sql, args).await
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let mut conn = self.lease().await?;
        conn.exec(sql, args).await
    }

    async fn begin(&self) -> Result<Box<dyn Tx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DataHubError::persistence(format!("begin transaction: {e}")))?;
        Ok(Box::new(SqliteTx(Some(tx))))
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            capacity: self.capacity,
            leased: self.pool.size() as usize - self.pool.num_idle(),
            idle: self.pool.num_idle(),
            lifetime_lease_timeouts: self.lease_timeouts.load(Ordering::Relaxed),
            lifetime_slow_queries: self.slow_queries.load(Ordering::Relaxed),
        }
    }
}

fn job_kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Download => "download",
        JobKind::Export => "export",
        JobKind::Maintenance => "maintenance",
    }
}

fn job_kind_from_str(s: &str) -> JobKind {
    match s {
        "download" => JobKind::Download,
        "export" => JobKind::Export,
        _ => JobKind::Maintenance,
    }
}

fn job_state_str(state: JobState) -> &'static str {
    match state {
        JobState::Submitted => "submitted",
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Paused => "paused",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

fn job_state_from_str(s: &str) -> JobState {
    match s {
        "submitted" => JobState::Submitted,
        "queued" => JobState::Queued,
        "running" => JobState::Running,
        "paused" => JobState::Paused,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        _ => JobState::Cancelled,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_job(row: &SqliteRow) -> Job {
    let metadata_raw: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());
    Job {
        id: row.try_get("id").unwrap_or_default(),
        kind: job_kind_from_str(&row.try_get::<String, _>("kind").unwrap_or_default()),
        priority: row.try_get("priority").unwrap_or(0),
        state: job_state_from_str(&row.try_get::<String, _>("state").unwrap_or_default()),
        description: row.try_get("description").unwrap_or_default(),
        created_by: row.try_get("created_by").unwrap_or_default(),
        created_at: parse_ts(&row.try_get::<String, _>("created_at").unwrap_or_default()),
        started_at: row
            .try_get::<Option<String>, _>("started_at")
            .ok()
            .flatten()
            .map(|s| parse_ts(&s)),
        ended_at: row
            .try_get::<Option<String>, _>("ended_at")
            .ok()
            .flatten()
            .map(|s| parse_ts(&s)),
        retry_count: row.try_get::<i64, _>("retry_count").unwrap_or(0) as u32,
        max_retries: row.try_get::<i64, _>("max_retries").unwrap_or(0) as u32,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        last_error: row.try_get("last_error").unwrap_or(None),
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at").unwrap_or_default()),
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let metadata = serde_json::to_string(&job.metadata)
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO jobs (id, kind, priority, state, description, created_by, created_at,
                                 started_at, ended_at, retry_count, max_retries, metadata, last_error, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
               ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind, priority = excluded.priority, state = excluded.state,
                 description = excluded.description, created_by = excluded.created_by,
                 started_at = excluded.started_at, ended_at = excluded.ended_at,
                 retry_count = excluded.retry_count, max_retries = excluded.max_retries,
                 metadata = excluded.metadata, last_error = excluded.last_error,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&job.id)
        .bind(job_kind_str(job.kind))
        .bind(job.priority)
        .bind(job_state_str(job.state))
        .bind(&job.description)
        .bind(&job.created_by)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.ended_at.map(|t| t.to_rfc3339()))
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(metadata)
        .bind(&job.last_error)
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(())
    }

    async fn save_progress(&self, progress: &Progress) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO job_progress (job_id, current, total, message, percentage, rate_per_sec, eta_seconds, completed, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(job_id) DO UPDATE SET
                 current = excluded.current, total = excluded.total, message = excluded.message,
                 percentage = excluded.percentage, rate_per_sec = excluded.rate_per_sec,
                 eta_seconds = excluded.eta_seconds, completed = excluded.completed,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&progress.job_id)
        .bind(progress.current as i64)
        .bind(progress.total as i64)
        .bind(&progress.message)
        .bind(progress.percentage)
        .bind(progress.rate_per_sec)
        .bind(progress.eta_seconds)
        .bind(progress.completed)
        .bind(progress.last_update.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DataHubError::persistence(e.to_string()))?;

        sqlx::query(
            "INSERT INTO progress_history (job_id, current, total, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&progress.job_id)
        .bind(progress.current as i64)
        .bind(progress.total as i64)
        .bind(progress.last_update.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(())
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        let data = event
            .data
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO job_events (job_id, kind, message, data, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&event.job_id)
        .bind(format!("{:?}", event.kind).to_lowercase())
        .bind(&event.message)
        .bind(if data.is_empty() { None } else { Some(data) })
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn load_progress(&self, job_id: &str) -> Result<Option<Progress>> {
        let row = sqlx::query("SELECT * FROM job_progress WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let current: i64 = row.try_get("current").unwrap_or(0);
        let total: i64 = row.try_get("total").unwrap_or(0);
        let mut progress = Progress::restored(job_id.to_string(), current as u64, total as u64);
        progress.message = row.try_get("message").unwrap_or_default();
        progress.percentage = row.try_get("percentage").unwrap_or(0.0);
        progress.rate_per_sec = row.try_get("rate_per_sec").unwrap_or(0.0);
        progress.eta_seconds = row.try_get("eta_seconds").ok();
        progress.completed = row.try_get::<bool, _>("completed").unwrap_or(false);
        Ok(Some(progress))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        // Pushing the whole filter into SQL buys little here since job
        // tables stay small (bounded by `job_retention`); load then
        // filter in memory, same as the in-memory test double.
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        let jobs: Vec<Job> = rows.iter().map(row_to_job).collect();
        Ok(filter.apply(&jobs))
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DataHubError::persistence(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ProgressPersistence for SqliteStore {
    async fn save_progress(&self, progress: &Progress) {
        if let Err(e) = JobStore::save_progress(self, progress).await {
            tracing::warn!(job_id = %progress.job_id, error = %e, "failed to persist progress");
        }
    }
}

pub fn store_as_arc(pool: SqlitePool, capacity: usize) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(pool, capacity))
}

//! Table and index definitions (spec §6). Run once at startup; every
//! statement is `IF NOT EXISTS` so opening an already-migrated database
//! is a no-op.

use sqlx::SqlitePool;

use datahub_core::{DataHubError, Result};

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id           TEXT PRIMARY KEY,
        kind         TEXT NOT NULL,
        priority     INTEGER NOT NULL,
        state        TEXT NOT NULL,
        description  TEXT NOT NULL DEFAULT '',
        created_by   TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL,
        started_at   TEXT,
        ended_at     TEXT,
        retry_count  INTEGER NOT NULL DEFAULT 0,
        max_retries  INTEGER NOT NULL DEFAULT 0,
        metadata     TEXT NOT NULL DEFAULT '{}',
        last_error   TEXT,
        updated_at   TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_kind ON jobs (kind)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_by ON jobs (created_by)",
    r#"CREATE TABLE IF NOT EXISTS job_progress (
        job_id       TEXT PRIMARY KEY REFERENCES jobs (id) ON DELETE CASCADE,
        current      INTEGER NOT NULL DEFAULT 0,
        total        INTEGER NOT NULL DEFAULT 0,
        message      TEXT NOT NULL DEFAULT '',
        percentage   REAL NOT NULL DEFAULT 0,
        rate_per_sec REAL NOT NULL DEFAULT 0,
        eta_seconds  REAL,
        completed    INTEGER NOT NULL DEFAULT 0,
        updated_at   TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS progress_history (
        job_id     TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        current    INTEGER NOT NULL,
        total      INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_progress_history_job ON progress_history (job_id, recorded_at)",
    r#"CREATE TABLE IF NOT EXISTS job_events (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id    TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        kind      TEXT NOT NULL,
        message   TEXT NOT NULL DEFAULT '',
        data      TEXT,
        occurred_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_job_events_occurred_at ON job_events (occurred_at)",
    r#"CREATE TABLE IF NOT EXISTS items (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id      TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        payload     TEXT NOT NULL,
        received_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_items_job ON items (job_id)",
    r#"CREATE TABLE IF NOT EXISTS download_metadata (
        job_id     TEXT PRIMARY KEY REFERENCES jobs (id) ON DELETE CASCADE,
        cursor     TEXT,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS batch_status (
        job_id       TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        batch_index  INTEGER NOT NULL,
        status       TEXT NOT NULL,
        completed    INTEGER NOT NULL DEFAULT 0,
        data_source  TEXT NOT NULL DEFAULT '',
        updated_at   TEXT NOT NULL,
        PRIMARY KEY (job_id, batch_index)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_batch_status_completed_source ON batch_status (completed, data_source)",
    r#"CREATE TABLE IF NOT EXISTS query_cache (
        cache_key  TEXT PRIMARY KEY,
        result     TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )"#,
];

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DataHubError::persistence(format!("migration failed: {e}")))?;
    }
    Ok(())
}
